//! CLI command definitions
//!
//! Defines the clap commands for the debugger CLI.

use clap::{Args, Subcommand};

/// Where to find the target. Unset values come from the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Target host
    #[arg(long)]
    pub host: Option<String>,

    /// Target port (default: 1337)
    #[arg(long, short)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect, list the target's threads grouped by script buffer, disconnect
    Threads {
        #[command(flatten)]
        target: TargetArgs,

        /// Print the thread list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Attach to a running target and debug interactively
    Attach {
        #[command(flatten)]
        target: TargetArgs,

        /// Set initial breakpoint(s) as script:address.
        /// Can be specified multiple times: -b main:0x100 -b sub:64
        #[arg(long = "break", short = 'b')]
        initial_breakpoints: Vec<String>,

        /// Resume the threads automatically after reporting a hit
        #[arg(long)]
        auto_continue: bool,
    },
}
