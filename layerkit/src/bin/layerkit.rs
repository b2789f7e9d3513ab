use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use layerkit::runtime::HOME_ENV;
use layerkit::{BuildOptions, LaunchOptions, LayerkitOptions, LayerkitRuntime, Recipe, StepStatus};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "layerkit")]
#[command(about = "Build layered images from a recipe and launch them")]
struct Cli {
    /// State directory (blobs, database, logs).
    #[arg(long, global = true, env = HOME_ENV)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the reference recipe into DIR.
    Init {
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Overwrite an existing recipe.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Build an image from a recipe.
    Build {
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
        #[arg(short = 't', long = "tag")]
        tag: Option<String>,
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        #[arg(default_value = ".")]
        context: PathBuf,
    },
    /// Run an image's command in the foreground.
    Run {
        #[arg(long, default_value_t = false)]
        keep_rootfs: bool,
        tag: String,
    },
    /// List images.
    Images,
    /// Print an image's record, manifest and config as JSON.
    Inspect { tag: String },
    /// Manage base environments.
    Base {
        #[command(subcommand)]
        command: BaseCommand,
    },
}

#[derive(Subcommand)]
enum BaseCommand {
    /// Import a directory tree as a pinned base environment.
    Import { reference: String, dir: PathBuf },
    /// List imported base environments.
    List,
}

fn open_runtime(home: Option<PathBuf>) -> anyhow::Result<LayerkitRuntime> {
    let options = match home {
        Some(home) => LayerkitOptions::with_home(
            std::path::absolute(&home)
                .with_context(|| format!("invalid home directory {}", home.display()))?,
        ),
        None => LayerkitOptions::default(),
    };
    LayerkitRuntime::new(options).context("failed to open layerkit home")
}

fn init_recipe(dir: &Path, force: bool) -> anyhow::Result<()> {
    let path = dir.join(layerkit::recipe::DEFAULT_RECIPE_FILE);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, Recipe::python_service().to_string())
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Init { dir, force } => init_recipe(&dir, force)?,
        Commands::Build {
            file,
            tag,
            no_cache,
            context,
        } => {
            let runtime = open_runtime(cli.home)?;
            let mut options = BuildOptions::new(context).no_cache(no_cache);
            options.recipe_file = file;
            options.tag = tag;

            let report = runtime.build(options).await?;
            for (index, step) in report.steps.iter().enumerate() {
                let status = match step.status {
                    StepStatus::Cached => "CACHED",
                    StepStatus::Executed => "RUN",
                };
                println!(
                    "[{}/{}] {:<6} {} ({} ms)",
                    index + 1,
                    report.steps.len(),
                    status,
                    step.created_by,
                    step.duration_ms
                );
            }
            println!("{} {}", report.image.name, report.image.digest);
        }
        Commands::Run { keep_rootfs, tag } => {
            let runtime = open_runtime(cli.home)?;
            let outcome = runtime.launch(&tag, LaunchOptions { keep_rootfs }).await?;
            // Exit codes above 255 cannot be represented; signal deaths are 128+n.
            return Ok(ExitCode::from(u8::try_from(outcome.exit_code).unwrap_or(1)));
        }
        Commands::Images => {
            let runtime = open_runtime(cli.home)?;
            println!("{:<40} {:<20} CREATED", "NAME", "DIGEST");
            for image in runtime.images()? {
                println!(
                    "{:<40} {:<20} {}",
                    image.name,
                    image.manifest_digest.short(),
                    image.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Inspect { tag } => {
            let runtime = open_runtime(cli.home)?;
            let image = runtime.inspect(&tag)?;
            println!("{}", serde_json::to_string_pretty(&image)?);
        }
        Commands::Base { command } => {
            let runtime = open_runtime(cli.home)?;
            match command {
                BaseCommand::Import { reference, dir } => {
                    let record = runtime.import_base(&reference, &dir).await?;
                    println!("{} {}", record.reference, record.layer.digest);
                }
                BaseCommand::List => {
                    println!("{:<40} LAYER", "REFERENCE");
                    for record in runtime.bases()? {
                        println!("{:<40} {}", record.reference, record.layer.digest.short());
                    }
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
