use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use uki_compose::assemble::BootCommandLine;
use uki_compose::checkpoint::manifest;
use uki_compose::config::{default_config_path, load_config, ComposeConfig};
use uki_compose::extract::GuestfishBackend;
use uki_compose::pipeline::{ComposeContext, ComposeRun, LogObserver, Pipeline};
use uki_compose::preflight::{check_required_tools, required_tools};
use uki_compose::remote::WeldrClient;
use uki_compose::{Artifact, CheckpointStore};

#[derive(Parser)]
#[command(name = "uki-compose")]
#[command(about = "Compose a verity-protected unified kernel image from an image-builder blueprint")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) the compose pipeline
    Compose {
        /// Working directory holding the checkpoints
        #[arg(long)]
        workdir: PathBuf,

        /// Image version, stamped into the blueprint and os-release
        #[arg(long = "version", value_name = "VERSION")]
        image_version: String,

        /// Debug kernel command line (rescue shell, long timeouts)
        #[arg(long)]
        debug: bool,

        /// Boot the result in QEMU after assembling it
        #[arg(long)]
        boot_test: bool,

        /// Config file (default: <config dir>/uki-compose/compose.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show which checkpoints a working directory holds
    Status {
        #[arg(long)]
        workdir: PathBuf,
    },
    /// Print the kernel command line for a verity UUID and root hash
    Cmdline {
        #[arg(long)]
        uuid: String,

        #[arg(long)]
        root_hash: String,

        #[arg(long)]
        debug: bool,
    },
    /// Check that every host tool a run needs is installed
    Preflight {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Include the boot test tools
        #[arg(long)]
        boot_test: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Compose {
            workdir,
            image_version,
            debug,
            boot_test,
            config,
        } => compose(workdir, image_version, debug, boot_test, config.as_deref()),
        Commands::Status { workdir } => status(&workdir),
        Commands::Cmdline {
            uuid,
            root_hash,
            debug,
        } => {
            let line = BootCommandLine::new(&uuid, &root_hash, debug)
                .context("building kernel command line")?;
            println!("{line}");
            Ok(())
        }
        Commands::Preflight { config, boot_test } => {
            let config = config_from(config.as_deref())?;
            let boot_test = boot_test || config.test.enabled;
            check_required_tools(&required_tools(&config, boot_test))
                .context("preflight failed")?;
            println!("All required host tools are installed.");
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn config_from(path: Option<&Path>) -> Result<ComposeConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()
            .context("no config directory on this platform; pass --config")?,
    };
    load_config(&path).with_context(|| format!("loading config '{}'", path.display()))
}

fn compose(
    workdir: PathBuf,
    version: String,
    debug: bool,
    boot_test: bool,
    config: Option<&Path>,
) -> Result<()> {
    if version.trim().is_empty() {
        bail!("--version must not be empty");
    }
    let config = config_from(config)?;
    let boot_test = boot_test || config.test.enabled;
    check_required_tools(&required_tools(&config, boot_test)).context("preflight failed")?;

    let store = CheckpointStore::open(&workdir)
        .with_context(|| format!("opening working directory '{}'", workdir.display()))?;
    let service = WeldrClient::new(&config.service.base_url)
        .with_context(|| format!("connecting to '{}'", config.service.base_url))?;
    let disks = GuestfishBackend::new(&config.tools.guestfish);
    let run = ComposeRun {
        workdir,
        version,
        debug,
    };
    let ctx = ComposeContext {
        run: &run,
        config: &config,
        store: &store,
        service: &service,
        disks: &disks,
        poll_interval: None,
    };

    let summary = Pipeline::standard(boot_test)
        .run(&ctx, &mut LogObserver)
        .with_context(|| format!("composing in '{}'", run.workdir.display()))?;

    println!(
        "[compose] {} phase(s) run, {} resumed; boot executable at {}",
        summary.ran.len(),
        summary.resumed.len(),
        store.path(Artifact::BootExecutable).display()
    );
    Ok(())
}

/// Reads the directory without taking the store lock, so it works while a
/// compose is running.
fn status(workdir: &Path) -> Result<()> {
    if !workdir.is_dir() {
        bail!("'{}' is not a directory", workdir.display());
    }
    for artifact in Artifact::ALL {
        let path = workdir.join(artifact.file_name());
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                println!("  committed  {:<14} {:>12} bytes", artifact.file_name(), meta.len())
            }
            _ => println!("  missing    {}", artifact.file_name()),
        }
    }

    match manifest::load_manifest(workdir).context("reading run manifest")? {
        Some(m) => println!(
            "last run: version {} ({}), {} at {}",
            m.version,
            if m.debug { "debug" } else { "production" },
            m.status,
            m.finished_at_utc.as_deref().unwrap_or(&m.created_at_utc)
        ),
        None => println!("no completed run recorded"),
    }
    Ok(())
}
