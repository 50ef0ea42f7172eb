//! meshrelay - relay Meshtastic mesh messages to notification sinks
//!
//! Two subcommands: `run` starts the relay against a real (or simulated)
//! node, `simulate` serves a fake device on a PTY for local development.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use meshrelay::{Config, RelayService};

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "Relay Meshtastic mesh messages to notification sinks", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay service
    Run {
        /// Path to the YAML configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Validate the configuration and exit without connecting
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve a simulated Meshtastic device on a PTY
    Simulate {
        /// Seconds between auto-generated messages (0 disables them)
        #[arg(long, default_value_t = 30)]
        interval: u64,

        /// Enable debug logging
        #[arg(long, short)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, dry_run } => run(config, dry_run).await,
        Command::Simulate { interval, verbose } => simulate(interval, verbose).await,
    }
}

async fn run(config_path: Option<PathBuf>, dry_run: bool) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => Config::from_yaml_file(path)?,
        None => Config::with_default_output(),
    };
    config.apply_env();

    if let Err(e) = config.validate() {
        // Validation failures are user errors; print them plainly
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    }

    if dry_run {
        println!("configuration OK");
        return Ok(());
    }

    init_logging(&config.logging.level, &config.logging.format)?;

    let service = RelayService::new(config);
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_cancel.cancel();
        }
    });

    if let Err(e) = service.start(cancel.clone()).await {
        error!(error = %e, "failed to start relay service");
        std::process::exit(1);
    }

    cancel.cancelled().await;
    service.stop().await?;
    Ok(())
}

#[cfg(unix)]
async fn simulate(interval: u64, verbose: bool) -> anyhow::Result<()> {
    use meshrelay_proto::{Device, DeviceConfig};
    use std::time::Duration;

    let level = if verbose { "debug" } else { "info" };
    init_logging(level, "text")?;

    let config = DeviceConfig {
        message_interval: Duration::from_secs(interval),
        ..DeviceConfig::default()
    };

    let cancel = CancellationToken::new();
    let mut device = Device::new(config);
    let path = device.start(&cancel).await?;

    println!("simulated device ready on {}", path.display());
    println!("connect with: meshrelay run (connection.serial.port: {})", path.display());

    tokio::signal::ctrl_c().await?;
    info!("stopping simulator");
    cancel.cancel();
    device.stop().await;
    Ok(())
}

#[cfg(not(unix))]
async fn simulate(_interval: u64, _verbose: bool) -> anyhow::Result<()> {
    anyhow::bail!("the simulator requires a platform with pseudo-terminals")
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let level = match level {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if format == "json" {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::fmt().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}
