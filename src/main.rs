use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use agent_fleet::commands::{dispatch, Command, CommandResponse};
use agent_fleet::instance::Orchestrator;
use agent_fleet::paths::Paths;
use agent_fleet::Result;

#[derive(Debug, Parser)]
#[command(
    name = "agent-fleet",
    version,
    about = "Run fleets of paired browser and app server instances"
)]
struct Cli {
    /// Data directory (default: ~/.agent_fleet)
    #[arg(long, global = true, env = "AGENT_FLEET_HOME")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    #[command(flatten)]
    Fleet(Command),
    /// Watch running instances and print events until interrupted
    Monitor {
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => log::error!("Failed to serialize output: {}", e),
    }
}

async fn open(data_dir: Option<PathBuf>) -> Result<Orchestrator> {
    let paths = match data_dir {
        Some(dir) => Paths::new(dir),
        None => Paths::from_env()?,
    };
    let orchestrator = Orchestrator::open(paths)?;
    orchestrator.probe_all().await;
    Ok(orchestrator)
}

async fn monitor(orchestrator: Orchestrator, interval: Duration) {
    let orchestrator = Arc::new(orchestrator);
    let mut events = orchestrator.subscribe();
    let handle = Arc::clone(&orchestrator).spawn_monitor(interval);
    log::info!("Monitoring instances every {:?}, press Ctrl-C to exit", interval);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_json(&event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Event listener lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    handle.abort();
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let orchestrator = match open(cli.data_dir).await {
        Ok(o) => o,
        Err(e) => {
            print_json(&CommandResponse::from_result::<()>(Err(e)));
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        CliCommand::Monitor { interval_secs } => {
            monitor(orchestrator, Duration::from_secs(interval_secs.max(1))).await;
            ExitCode::SUCCESS
        }
        CliCommand::Fleet(command) => {
            let response = dispatch(&orchestrator, command).await;
            print_json(&response);
            if response.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
