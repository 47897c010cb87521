//! CLI command handling
//!
//! Connects to the target for each command and formats output.

mod repl;

use std::sync::Arc;

use crate::commands::{Commands, TargetArgs};
use crate::common::{config::Config, Result};
use crate::proto::ThreadMap;
use crate::session::{Breakpoint, Debugger, SessionOptions};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    let config = Config::load()?;

    match command {
        Commands::Threads { target, json } => {
            let debugger = connect(&config, &target).await?;
            let threads = debugger.threads().await;
            debugger.close().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&threads)?);
            } else {
                print_threads(&threads);
            }

            Ok(())
        }

        Commands::Attach {
            target,
            initial_breakpoints,
            auto_continue,
        } => {
            // Reject bad locations before touching the network
            let breakpoints = initial_breakpoints
                .iter()
                .map(|loc| Breakpoint::parse(loc))
                .collect::<Result<Vec<_>>>()?;

            let debugger = Arc::new(connect(&config, &target).await?);
            println!("Attached to {}", debugger.addr());
            print_threads(&debugger.threads().await);

            for bp in &breakpoints {
                match debugger.set_breakpoint(&bp.script_buffer, bp.address).await {
                    Ok(()) => {
                        if debugger.breakpoints().await.contains(bp) {
                            println!("Breakpoint set at {}", bp);
                        } else {
                            eprintln!("Warning: no threads run {}, {} not set", bp.script_buffer, bp);
                        }
                    }
                    Err(e) if !e.is_fatal() => eprintln!("Warning: could not set {}: {}", bp, e),
                    Err(e) => return Err(e),
                }
            }

            repl::run(debugger, config.poll_interval(), auto_continue).await
        }
    }
}

async fn connect(config: &Config, target: &TargetArgs) -> Result<Debugger> {
    let host = target.host.as_deref().unwrap_or(&config.target.host);
    let port = target.port.unwrap_or(config.target.port);
    Debugger::connect(host, port, &SessionOptions::from(config)).await
}

pub(crate) fn print_threads(threads: &ThreadMap) {
    if threads.is_empty() {
        println!("No script threads running");
        return;
    }

    println!("Threads:");
    for (script_buffer, tids) in threads {
        let tids: Vec<String> = tids.iter().map(ToString::to_string).collect();
        println!("  {:<24} {}", script_buffer, tids.join(", "));
    }
}

pub(crate) fn print_breakpoints(breakpoints: &[Breakpoint]) {
    if breakpoints.is_empty() {
        println!("No breakpoints set");
        return;
    }

    println!("Breakpoints:");
    for bp in breakpoints {
        println!("  {}", bp);
    }
}
