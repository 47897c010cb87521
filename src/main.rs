//! SC3 Debugger CLI
//!
//! Connects to a running script VM over TCP and drives its debug protocol
//! from the command line.

use clap::Parser;
use commands::Commands;
use sc3dbg::{cli, commands, common::logging};

#[derive(Parser)]
#[command(name = "sc3dbg", about = "Remote debugger for SC3 script VMs")]
#[command(version, long_about = None)]
struct Cli {
    /// Also write a detailed trace log to the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.log_file {
        if let Some(path) = logging::init_with_log_file() {
            eprintln!("Logging to {}", path.display());
        }
    } else {
        logging::init_cli();
    }

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
