//! Process launcher.
//!
//! Starts exactly one foreground process from an image:
//!
//! 1. Parse the image command into program, entry point and binding.
//! 2. Materialize an ephemeral root filesystem from the image layers.
//! 3. Pre-flight the entry point and locate the program. Any failure here
//!    is an `EntryPointError` and no process is started.
//! 4. Spawn the program in the working directory, forward Ctrl-C and
//!    SIGTERM to it, and return its exit status.

mod container;
mod entrypoint;

pub use container::{ContainerId, ContainerRootfs};
pub use entrypoint::EntryPoint;

use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use crate::images::Image;
use crate::runtime::{LaunchOptions, RuntimeInner};
use crate::util::{kill_process, signal_process};

/// Host used when the command has no `--host`.
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// Port used when the command has no `--port`.
pub const DEFAULT_PORT: u16 = 8000;

/// Directories searched inside the image for bare program names, after the
/// working directory.
const IMAGE_BIN_DIRS: [&str; 3] = ["/usr/local/bin", "/usr/bin", "/bin"];

/// Address the launched process is told to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub host: IpAddr,
    pub port: u16,
}

impl Binding {
    /// `0.0.0.0` or `::`: reachable from outside the host.
    pub fn is_all_interfaces(&self) -> bool {
        self.host.is_unspecified()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for Binding {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST,
            port: DEFAULT_PORT,
        }
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Parsed startup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub entry_point: EntryPoint,
    pub binding: Binding,
    /// Everything after the program, passed through unchanged.
    pub args: Vec<String>,
}

fn parse_host(value: &str) -> LayerkitResult<IpAddr> {
    if value == "localhost" {
        return Ok(DEFAULT_HOST);
    }
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| LayerkitError::EntryPoint(format!("invalid --host value '{}'", value)))
}

fn parse_port(value: &str) -> LayerkitResult<u16> {
    value
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| LayerkitError::EntryPoint(format!("invalid --port value '{}'", value)))
}

impl LaunchSpec {
    /// Parse `[program, module:attribute, flags...]`.
    pub fn from_command(argv: &[String]) -> LayerkitResult<Self> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| LayerkitError::EntryPoint("image has no startup command".into()))?;
        let entry = rest.first().ok_or_else(|| {
            LayerkitError::EntryPoint(format!("'{}' is missing its module:attribute argument", program))
        })?;
        let entry_point = EntryPoint::parse(entry)?;

        let mut binding = Binding::default();
        let mut flags = rest[1..].iter();
        while let Some(flag) = flags.next() {
            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (flag.as_str(), None),
            };
            if name != "--host" && name != "--port" {
                continue;
            }
            let value = match inline {
                Some(value) => value,
                None => flags.next().cloned().ok_or_else(|| {
                    LayerkitError::EntryPoint(format!("{} requires a value", name))
                })?,
            };
            if name == "--host" {
                binding.host = parse_host(&value)?;
            } else {
                binding.port = parse_port(&value)?;
            }
        }

        Ok(Self {
            program: program.clone(),
            entry_point,
            binding,
            args: rest.to_vec(),
        })
    }
}

/// Result of a finished launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub container_id: String,
    pub binding: Binding,
    /// Process exit code; `128 + signo` when killed by a signal.
    pub exit_code: i32,
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locate `program` for a process whose root filesystem is `rootfs` and
/// whose working directory is `workdir` (an absolute in-image path).
pub fn find_program(program: &str, rootfs: &Path, workdir: &Path) -> Option<PathBuf> {
    let in_rootfs = |in_image: &Path| {
        crate::layers::safe_join(rootfs, in_image.strip_prefix("/").unwrap_or(in_image))
    };

    if program.contains('/') {
        let path = Path::new(program);
        let in_image = if path.is_absolute() {
            path.to_path_buf()
        } else {
            workdir.join(path)
        };
        if let Some(candidate) = in_rootfs(&in_image).filter(|p| is_executable(p)) {
            return Some(candidate);
        }
        return (path.is_absolute() && is_executable(path)).then(|| path.to_path_buf());
    }

    let image_dirs = std::iter::once(workdir.to_path_buf())
        .chain(IMAGE_BIN_DIRS.iter().map(PathBuf::from))
        .filter_map(|dir| in_rootfs(&dir));
    let host_dirs = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect::<Vec<_>>())
        .unwrap_or_default();

    image_dirs
        .chain(host_dirs)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// `PATH` for processes run against `rootfs`: image bin dirs, then the host's.
pub fn search_path(rootfs: &Path) -> OsString {
    let mut dirs: Vec<PathBuf> = IMAGE_BIN_DIRS
        .iter()
        .map(|dir| rootfs.join(dir.trim_start_matches('/')))
        .collect();
    if let Some(host) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&host));
    }
    std::env::join_paths(dirs).unwrap_or_default()
}

/// Exit code of a finished process, mapping signal deaths to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(1)
}

pub(crate) async fn launch(
    runtime: &RuntimeInner,
    image: Image,
    options: &LaunchOptions,
) -> LayerkitResult<LaunchOutcome> {
    let spec = LaunchSpec::from_command(image.command())?;
    let workdir = image.working_dir().clone();

    let layers: Vec<PathBuf> = image
        .layer_digests()
        .map(|digest| runtime.blobs.path(digest))
        .collect();
    let containers_dir = runtime.layout.containers_dir();
    let keep = options.keep_rootfs;
    let rootfs = tokio::task::spawn_blocking(move || {
        ContainerRootfs::create(&containers_dir, &layers, keep)
    })
    .await
    .map_err(|e| LayerkitError::Internal(format!("rootfs task panicked: {}", e)))??;

    let host_workdir = rootfs.host_path(&workdir)?;
    if !host_workdir.is_dir() {
        return Err(LayerkitError::Path(format!(
            "working directory {} does not exist in image {}",
            workdir.display(),
            image.record.name
        )));
    }

    let module_file = spec.entry_point.resolve(&host_workdir)?;
    let program = find_program(&spec.program, rootfs.path(), &workdir).ok_or_else(|| {
        LayerkitError::EntryPoint(format!(
            "program '{}' not found in image or on host PATH",
            spec.program
        ))
    })?;

    tracing::info!(
        container_id = %rootfs.id().short(),
        image = %image.record.name,
        entry_point = %spec.entry_point,
        module = %module_file.display(),
        program = %program.display(),
        binding = %spec.binding,
        all_interfaces = spec.binding.is_all_interfaces(),
        "Starting process"
    );

    let mut child = Command::new(&program)
        .args(&spec.args)
        .current_dir(&host_workdir)
        .env("PATH", search_path(rootfs.path()))
        .env("LAYERKIT_ROOTFS", rootfs.path())
        .env("LAYERKIT_CONTAINER_ID", rootfs.id().as_str())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            LayerkitError::Launch(format!("failed to start {}: {}", program.display(), e))
        })?;
    let pid = child.id().ok_or_else(|| {
        LayerkitError::Launch(format!("{} exited before its pid was read", program.display()))
    })?;

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| LayerkitError::Launch(format!("cannot install SIGTERM handler: {}", e)))?;

    // The first interrupt asks the process to stop; a second one kills it.
    let mut interrupts = 0u32;
    let status = loop {
        let reason = tokio::select! {
            status = child.wait() => {
                break status.map_err(|e| {
                    LayerkitError::Launch(format!("failed to wait for process {}: {}", pid, e))
                })?;
            }
            _ = tokio::signal::ctrl_c() => "Interrupted",
            _ = sigterm.recv() => "Terminated",
        };
        interrupts += 1;
        if interrupts == 1 {
            tracing::info!(pid, "{}, forwarding SIGTERM", reason);
            signal_process(pid, libc::SIGTERM);
        } else {
            tracing::warn!(pid, "{} again, killing process", reason);
            kill_process(pid);
        }
    };

    let exit_code = exit_code(status);
    tracing::info!(
        container_id = %rootfs.id().short(),
        pid,
        exit_code,
        "Process exited"
    );
    if exit_code != 0 {
        runtime
            .runtime_metrics
            .launches_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    Ok(LaunchOutcome {
        container_id: rootfs.id().to_string(),
        binding: spec.binding,
        exit_code,
    })
}
