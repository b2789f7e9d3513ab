//! End-to-end tests: import a base, build a service image, launch it.
//!
//! The install step runs a shell command that records each execution in a
//! counter file outside the image, so tests can tell whether it ran.
//!
//! Socket tests use a `serve` script that re-runs this test binary as a
//! one-shot TCP listener (`serve_stub_listener`), so no host server is
//! needed.

use layerkit::{
    BuildOptions, LaunchOptions, LayerkitError, LayerkitOptions, LayerkitRuntime, StepStatus,
};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const TAG: &str = "refactor-api:latest";
const LISTEN_ENV: &str = "LAYERKIT_TEST_LISTEN";

struct Fixture {
    _home: TempDir,
    _base: TempDir,
    context: TempDir,
    scratch: TempDir,
    runtime: LayerkitRuntime,
}

impl Fixture {
    async fn new() -> Self {
        let home = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        std::fs::create_dir_all(base.path().join("etc")).unwrap();
        std::fs::write(base.path().join("etc/os-release"), "ID=debian\n").unwrap();

        let runtime = LayerkitRuntime::new(LayerkitOptions::with_home(home.path())).unwrap();
        runtime
            .import_base("python:3.11-slim", base.path())
            .await
            .unwrap();

        let fixture = Self {
            _home: home,
            _base: base,
            context: TempDir::new().unwrap(),
            scratch: TempDir::new().unwrap(),
            runtime,
        };
        fixture.write_recipe("cp requirements.txt installed.txt");
        fixture.write("requirements.txt", "fastapi==0.100.0\n");
        fixture.write("main.py", "from fastapi import FastAPI\n\napp = object()\n");
        fixture.write_serve_script();
        fixture
    }

    fn counter(&self) -> PathBuf {
        self.scratch.path().join("install-runs")
    }

    fn marker(&self) -> PathBuf {
        self.scratch.path().join("served")
    }

    fn install_runs(&self) -> usize {
        std::fs::read_to_string(self.counter())
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.context.path().join(name), content).unwrap();
    }

    fn write_recipe(&self, install: &str) {
        self.write_recipe_bound(install, "0.0.0.0", 8000);
    }

    fn write_recipe_bound(&self, install: &str, host: &str, port: u16) {
        self.write(
            "Dockerfile",
            &format!(
                "FROM python:3.11-slim\n\
                 WORKDIR /app\n\
                 COPY requirements.txt .\n\
                 RUN echo run >> {} && {}\n\
                 COPY . .\n\
                 EXPOSE {port}\n\
                 CMD [\"serve\", \"main:app\", \"--host\", \"{host}\", \"--port\", \"{port}\"]\n",
                self.counter().display(),
                install
            ),
        );
    }

    /// `serve` that listens on its `--host`/`--port` arguments and answers
    /// one connection.
    fn write_listening_serve_script(&self) {
        let exe = std::env::current_exe().unwrap();
        let path = self.context.path().join("serve");
        std::fs::write(
            &path,
            format!(
                "#!/bin/sh\ntouch {}\nexport {}=\"$3:$5\"\nexec '{}' serve_stub_listener --exact --nocapture\n",
                self.marker().display(),
                LISTEN_ENV,
                exe.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn write_serve_script(&self) {
        let path = self.context.path().join("serve");
        std::fs::write(
            &path,
            format!("#!/bin/sh\ntouch {}\nexit 0\n", self.marker().display()),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn options(&self) -> BuildOptions {
        BuildOptions::new(self.context.path()).tag(TAG)
    }
}

fn status(report: &layerkit::BuildReport, step: &str) -> StepStatus {
    report.step(step).unwrap().status
}

fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Child side of the socket tests. A no-op unless started by the `serve`
/// script with the listen address in the environment.
#[test]
fn serve_stub_listener() {
    let Ok(addr) = std::env::var(LISTEN_ENV) else {
        return;
    };
    let listener = TcpListener::bind(&addr).unwrap();
    let (mut stream, _) = listener.accept().unwrap();
    stream.write_all(b"pong\n").unwrap();
}

#[tokio::test]
async fn test_first_build_executes_every_step() {
    let fx = Fixture::new().await;
    let report = fx.runtime.build(fx.options()).await.unwrap();

    assert_eq!(report.image.name, TAG);
    assert_eq!(report.steps.len(), 7);
    assert_eq!(report.executed().len(), 7);
    assert_eq!(fx.install_runs(), 1);

    let image = fx.runtime.inspect(TAG).unwrap();
    assert_eq!(image.working_dir(), Path::new("/app"));
    assert_eq!(image.command()[1], "main:app");
    assert!(image.config.config.exposed_ports.contains_key("8000/tcp"));
    // Base, workdir, manifest, install and source produce layers.
    assert_eq!(image.manifest.layers.len(), 5);
    assert_eq!(image.config.history.len(), 7);
}

#[tokio::test]
async fn test_source_only_change_reuses_install_layer() {
    let fx = Fixture::new().await;
    let first = fx.runtime.build(fx.options()).await.unwrap();

    fx.write("main.py", "app = object()\nextra = 1\n");
    let second = fx.runtime.build(fx.options()).await.unwrap();

    assert_eq!(fx.install_runs(), 1);
    for step in ["resolve_base", "workdir", "copy_manifest", "install_dependencies"] {
        assert_eq!(status(&second, step), StepStatus::Cached, "step {}", step);
    }
    assert_eq!(status(&second, "copy_source"), StepStatus::Executed);
    assert_eq!(
        first.step("install_dependencies").unwrap().layer,
        second.step("install_dependencies").unwrap().layer
    );
    assert_ne!(first.image.digest, second.image.digest);
}

#[tokio::test]
async fn test_unchanged_rebuild_is_fully_cached() {
    let fx = Fixture::new().await;
    let first = fx.runtime.build(fx.options()).await.unwrap();
    let second = fx.runtime.build(fx.options()).await.unwrap();

    assert!(second.executed().is_empty());
    assert_eq!(first.image.digest, second.image.digest);
    assert_eq!(fx.runtime.metrics().steps_cached(), 7);
}

#[tokio::test]
async fn test_manifest_change_reruns_install_only_from_there() {
    let fx = Fixture::new().await;
    fx.runtime.build(fx.options()).await.unwrap();

    fx.write("requirements.txt", "fastapi==0.101.0\n");
    let report = fx.runtime.build(fx.options()).await.unwrap();

    assert_eq!(fx.install_runs(), 2);
    assert_eq!(status(&report, "resolve_base"), StepStatus::Cached);
    assert_eq!(status(&report, "workdir"), StepStatus::Cached);
    assert_eq!(status(&report, "copy_manifest"), StepStatus::Executed);
    assert_eq!(status(&report, "install_dependencies"), StepStatus::Executed);
    assert_eq!(status(&report, "copy_source"), StepStatus::Executed);
}

#[tokio::test]
async fn test_no_cache_rebuild_is_reproducible() {
    let fx = Fixture::new().await;
    let first = fx.runtime.build(fx.options()).await.unwrap();
    let second = fx
        .runtime
        .build(fx.options().no_cache(true))
        .await
        .unwrap();

    assert_eq!(second.executed().len(), 7);
    assert_eq!(fx.install_runs(), 2);
    assert_eq!(
        first.step("install_dependencies").unwrap().layer,
        second.step("install_dependencies").unwrap().layer
    );
    assert_eq!(first.image.digest, second.image.digest);
}

#[tokio::test]
async fn test_failing_install_records_no_image() {
    let fx = Fixture::new().await;
    fx.write_recipe("echo 'no matching distribution' && exit 7");

    let err = fx.runtime.build(fx.options()).await.unwrap_err();
    assert_eq!(err.kind(), "DependencyInstallError");
    assert!(err.to_string().contains("no matching distribution"), "{}", err);

    let err = fx.runtime.inspect(TAG).unwrap_err();
    assert!(matches!(err, LayerkitError::NotFound(_)));
    assert_eq!(fx.runtime.metrics().builds_failed(), 1);
}

#[tokio::test]
async fn test_installer_alone_judges_manifest_syntax() {
    let fx = Fixture::new().await;
    let hash = "0".repeat(64);
    fx.write(
        "requirements.txt",
        &format!(
            "fastapi==0.100.0 \\\n    --hash=sha256:{hash}\n\
             git+https://github.com/tiangolo/fastapi.git#egg=fastapi\n\
             ./vendor/localpkg\n\
             https://example.com/wheels/pkg-1.0-py3-none-any.whl\n"
        ),
    );

    let report = fx.runtime.build(fx.options()).await.unwrap();
    assert_eq!(status(&report, "install_dependencies"), StepStatus::Executed);
    assert_eq!(fx.install_runs(), 1);

    // Lines the installer rejects fail through its exit status.
    fx.write("requirements.txt", "fastapi=0.100.0\n");
    fx.write_recipe("grep -q '==' requirements.txt || (echo 'invalid requirement' && exit 1)");
    let err = fx.runtime.build(fx.options()).await.unwrap_err();
    assert_eq!(err.kind(), "DependencyInstallError");
    assert!(err.to_string().contains("invalid requirement"), "{}", err);
    assert_eq!(fx.install_runs(), 2);
}

#[tokio::test]
async fn test_unpinned_base_is_resolution_error() {
    let fx = Fixture::new().await;
    let recipe = std::fs::read_to_string(fx.context.path().join("Dockerfile")).unwrap();
    fx.write(
        "Dockerfile",
        &recipe.replace("FROM python:3.11-slim", "FROM python:latest"),
    );

    let err = fx.runtime.build(fx.options()).await.unwrap_err();
    assert_eq!(err.kind(), "ResolutionError");
    assert_eq!(fx.install_runs(), 0);
}

#[tokio::test]
async fn test_missing_base_is_resolution_error() {
    let fx = Fixture::new().await;
    let recipe = std::fs::read_to_string(fx.context.path().join("Dockerfile")).unwrap();
    fx.write(
        "Dockerfile",
        &recipe.replace("FROM python:3.11-slim", "FROM python:3.12-slim"),
    );

    let err = fx.runtime.build(fx.options()).await.unwrap_err();
    assert_eq!(err.kind(), "ResolutionError");
}

#[tokio::test]
async fn test_launch_runs_command_in_foreground() {
    let fx = Fixture::new().await;
    fx.runtime.build(fx.options()).await.unwrap();

    let outcome = fx
        .runtime
        .launch(TAG, LaunchOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.binding.is_all_interfaces());
    assert_eq!(outcome.binding.port, 8000);
    assert!(fx.marker().exists());
    // The ephemeral root filesystem is gone after exit.
    let containers = fx.runtime.layout().containers_dir();
    assert_eq!(std::fs::read_dir(containers).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_launched_process_accepts_connections_on_binding() {
    let fx = Fixture::new().await;
    let port = free_port();
    fx.write_recipe_bound("true", "127.0.0.1", port);
    fx.write_listening_serve_script();
    fx.runtime.build(fx.options()).await.unwrap();

    let runtime = fx.runtime.clone();
    let launch = tokio::spawn(async move { runtime.launch(TAG, LaunchOptions::default()).await });

    let mut stream = None;
    for _ in 0..200 {
        if let Ok(connected) = TcpStream::connect((Ipv4Addr::LOCALHOST, port)) {
            stream = Some(connected);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let mut stream = stream.expect("launched process never listened on its port");
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "pong\n");

    let outcome = launch.await.unwrap().unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.binding.port, port);
    assert!(!outcome.binding.is_all_interfaces());
}

#[tokio::test]
async fn test_missing_entry_module_fails_before_spawn() {
    let fx = Fixture::new().await;
    let port = free_port();
    fx.write_recipe_bound("true", "127.0.0.1", port);
    fx.write_listening_serve_script();
    std::fs::remove_file(fx.context.path().join("main.py")).unwrap();
    fx.runtime.build(fx.options()).await.unwrap();

    let err = fx
        .runtime
        .launch(TAG, LaunchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "EntryPointError");
    assert!(!fx.marker().exists());
    assert_eq!(fx.runtime.metrics().launches_failed(), 1);
    // Nothing took the port.
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err());
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
}

#[tokio::test]
async fn test_missing_entry_attribute_fails_before_spawn() {
    let fx = Fixture::new().await;
    fx.write("main.py", "def create_app():\n    app = object()\n    return app\n");
    fx.runtime.build(fx.options()).await.unwrap();

    let err = fx
        .runtime
        .launch(TAG, LaunchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "EntryPointError");
    assert!(!fx.marker().exists());
}

#[tokio::test]
async fn test_missing_manifest_is_path_error() {
    let fx = Fixture::new().await;
    std::fs::remove_file(fx.context.path().join("requirements.txt")).unwrap();

    let err = fx.runtime.build(fx.options()).await.unwrap_err();
    assert_eq!(err.kind(), "PathError");
}
