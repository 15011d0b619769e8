mod sink;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hsota_core::{
    FIRMWARE_VERSION, FileFlash, HostDevice, HttpTransport, ImageHeader, ProgressSink,
    TracingSink, UpdateConfig, UpdateOrchestrator, UpdateOutcome, UpdateScheduler, UpdateTarget,
};
use tracing::{error, info};

use crate::sink::IndicatifSink;

#[derive(Parser, Debug)]
#[command(author, version, about = "HomeSense OTA update tool", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log progress instead of drawing a progress bar
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one update check and install a newer image
    Check {
        /// Pretend to run this firmware version
        #[arg(long, default_value = FIRMWARE_VERSION)]
        current_version: String,
    },
    /// Check periodically until an update is installed
    Watch {
        #[arg(long, default_value = FIRMWARE_VERSION)]
        current_version: String,

        /// Seconds between checks (overrides the config)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Install a local image file and schedule a restart
    Install {
        /// Image file (app image, or a littlefs/spiffs image)
        image: PathBuf,

        /// Asset name used to pick the partition (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the header of a firmware image
    Inspect {
        /// Image file (app image, or a littlefs/spiffs image)
        image: PathBuf,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the default configuration
    Init {
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let progress_bar = !args.no_progress;
    match args.command {
        Command::Check { current_version } => {
            let config = load_config(args.config.as_deref())?;
            check(config, &current_version, progress_bar)
        }
        Command::Watch {
            current_version,
            interval,
        } => {
            let mut config = load_config(args.config.as_deref())?;
            if let Some(secs) = interval {
                config.check_interval_secs = secs.max(1);
            }
            watch(config, &current_version, progress_bar)
        }
        Command::Install { image, name } => {
            let config = load_config(args.config.as_deref())?;
            install(config, &image, name, progress_bar)
        }
        Command::Inspect { image } => inspect(&image),
        Command::Config {
            command: ConfigCommand::Init { path, force },
        } => init_config(&path, force),
    }
}

fn load_config(path: Option<&Path>) -> Result<UpdateConfig> {
    match path {
        Some(path) => UpdateConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(UpdateConfig::default()),
    }
}

type HostOrchestrator = UpdateOrchestrator<HttpTransport, FileFlash>;

fn build_orchestrator(
    config: UpdateConfig,
    current_version: &str,
    progress_bar: bool,
) -> Result<HostOrchestrator> {
    let transport = HttpTransport::new(&config).context("building HTTP client")?;
    let flash = FileFlash::open(&config.flash)
        .with_context(|| format!("opening flash root {}", config.flash.root.display()))?;
    let sink: Arc<dyn ProgressSink> = if progress_bar {
        Arc::new(IndicatifSink::new()?)
    } else {
        Arc::new(TracingSink)
    };

    info!(
        version = %current_version,
        manifest = %config.manifest_url,
        "Starting hsota"
    );
    let orchestrator =
        UpdateOrchestrator::new(config, current_version, transport, flash, Arc::new(HostDevice::new()))
            .context("invalid configuration")?;
    Ok(orchestrator.with_sink(sink))
}

fn check(config: UpdateConfig, current_version: &str, progress_bar: bool) -> Result<()> {
    let flash_root = config.flash.root.clone();
    let orchestrator = build_orchestrator(config, current_version, progress_bar)?;

    match orchestrator.check_for_update()? {
        UpdateOutcome::UpToDate { version } => {
            println!("Firmware {} is up to date", version);
        }
        UpdateOutcome::RebootPending {
            version,
            target,
            bytes,
        } => {
            println!(
                "Installed {} ({} image, {} bytes) under {}",
                version,
                target,
                bytes,
                flash_root.display()
            );
            println!(
                "Restart scheduled in {} ms",
                orchestrator.config().restart_delay_ms
            );
        }
    }
    Ok(())
}

fn watch(config: UpdateConfig, current_version: &str, progress_bar: bool) -> Result<()> {
    let interval = Duration::from_secs(config.check_interval_secs);
    let orchestrator = Arc::new(build_orchestrator(config, current_version, progress_bar)?);

    let scheduler = UpdateScheduler::spawn(orchestrator.clone(), interval)
        .context("starting update scheduler")?;
    scheduler.join();

    println!("Update installed ({}), restart pending", orchestrator.phase());
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn install(
    config: UpdateConfig,
    path: &Path,
    name: Option<String>,
    progress_bar: bool,
) -> Result<()> {
    let name = name.unwrap_or_else(|| file_name(path));
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();

    let flash_root = config.flash.root.clone();
    let orchestrator = build_orchestrator(config, FIRMWARE_VERSION, progress_bar)?;
    let installed = orchestrator.install_image(&name, Some(size), file)?;

    println!(
        "Installed {} ({} image, {} bytes) under {}",
        name,
        installed.target,
        installed.bytes,
        flash_root.display()
    );
    println!(
        "Restart scheduled in {} ms",
        orchestrator.config().restart_delay_ms
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let target = UpdateTarget::from_filename(&file_name(path));

    println!("File:        {}", path.display());
    println!("Size:        {} bytes", data.len());
    println!("Target:      {} ({})", target, target.label());

    if target == UpdateTarget::ApplicationImage {
        let header = ImageHeader::parse(&data).context("parsing image header")?;
        println!("{}", header);
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    UpdateConfig::default()
        .save_to_file(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
