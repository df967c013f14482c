//! gpupool CLI
//!
//! Command-line interface for interacting with the gpupool daemon.

mod commands;

use clap::{Parser, Subcommand};
use gpupool_core::DeviceId;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpupool - capacity accounting and placement for a GPU pool
#[derive(Parser, Debug)]
#[command(name = "gpupool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9190", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate devices
    Allocate(commands::DemandArgs),

    /// Release an allocation
    Release {
        /// Allocation ID
        allocation: String,
    },

    /// Move an allocation to other devices
    Migrate {
        /// Allocation ID
        allocation: String,

        /// Devices to move away from, besides the current ones
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<DeviceId>,
    },

    /// Show where a request would be placed without reserving
    Plan(commands::DemandArgs),

    /// List active allocations
    Ps,

    /// Show devices and their commitments
    Devices,

    /// Show cluster metrics and resource status
    Top,

    /// Add devices to the cluster
    Expand {
        /// Number of devices to add
        count: usize,
    },

    /// Remove the highest-indexed devices
    Shrink {
        /// Number of devices to remove
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Allocate(demand) => commands::allocate(&client, demand).await?,
        Commands::Release { allocation } => commands::release(&client, &allocation).await?,
        Commands::Migrate {
            allocation,
            exclude,
        } => commands::migrate(&client, &allocation, exclude).await?,
        Commands::Plan(demand) => commands::plan(&client, demand).await?,
        Commands::Ps => commands::ps(&client).await?,
        Commands::Devices => commands::devices(&client).await?,
        Commands::Top => commands::top(&client).await?,
        Commands::Expand { count } => commands::expand(&client, count).await?,
        Commands::Shrink { count } => commands::shrink(&client, count).await?,
    }

    Ok(())
}
