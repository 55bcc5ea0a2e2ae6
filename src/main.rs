use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shipyard::config::Config;
use shipyard::supervisor;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version, about = "Parallel coding-agent orchestration engine")]
pub struct Cli {
    /// State directory (overrides DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine: gateway, scheduler, and worker pool
    Serve {
        /// Gateway port (overrides WEB_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Worker slot count (overrides WORKER_COUNT)
        #[arg(long)]
        workers: Option<usize>,

        /// Bind on all interfaces with permissive CORS
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Serve { port, workers, dev } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(workers) = workers {
                config.worker_count = workers;
            }
            if dev {
                config.dev_mode = true;
            }
            supervisor::run(config).await
        }
    }
}
