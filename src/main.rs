//! Headless management console.
//!
//! Loads the server list, builds a container per server and takes operator
//! commands on stdin.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use mcga_core::config::{GlobalConfig, DEFAULT_CONFIG_PATH};
use mcga_core::event::{EventHub, LoggingListener};
use mcga_core::manager::ServerManager;

const HELP: &str = "Commands: list | start <name> | stop <name> | cmd <name> <text> | say <name> <text> | quit";

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand<'a> {
    List,
    Start(&'a str),
    Stop(&'a str),
    Send { server: &'a str, text: &'a str },
    Say { server: &'a str, text: &'a str },
    Help,
    Quit,
}

fn parse_command(line: &str) -> Option<ConsoleCommand<'_>> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim_start();
    let with_text = || {
        let (server, text) = rest.split_once(char::is_whitespace)?;
        let text = text.trim_start();
        (!text.is_empty()).then_some((server, text))
    };

    match verb {
        "list" | "ls" => Some(ConsoleCommand::List),
        "start" if !rest.is_empty() => Some(ConsoleCommand::Start(rest)),
        "stop" if !rest.is_empty() => Some(ConsoleCommand::Stop(rest)),
        "cmd" => with_text().map(|(server, text)| ConsoleCommand::Send { server, text }),
        "say" => with_text().map(|(server, text)| ConsoleCommand::Say { server, text }),
        "help" | "?" => Some(ConsoleCommand::Help),
        "quit" | "exit" => Some(ConsoleCommand::Quit),
        _ => None,
    }
}

/// Returns `false` when the console should exit.
async fn execute(manager: &ServerManager, command: ConsoleCommand<'_>) -> bool {
    let result = match command {
        ConsoleCommand::List => {
            for row in manager.list_servers().await {
                let state = if row.running { "running" } else { "idle" };
                println!("{:<20} {:<16} {}", row.name, format!("{:?}", row.mode), state);
            }
            Ok(())
        }
        ConsoleCommand::Start(name) => manager.start_server(name).await,
        ConsoleCommand::Stop(name) => manager.stop_server(name).await,
        ConsoleCommand::Send { server, text } => manager.send_command(server, text).await,
        ConsoleCommand::Say { server, text } => manager.send_chat_message(server, &[text]).await,
        ConsoleCommand::Help => {
            println!("{}", HELP);
            Ok(())
        }
        ConsoleCommand::Quit => return false,
    };

    if let Err(e) = result {
        tracing::error!("{} ({})", e, e.error_code());
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("mcga-core starting");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MCGA_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = GlobalConfig::load(&config_path)?;

    let hub = Arc::new(EventHub::new());
    hub.register(Arc::new(LoggingListener));

    let manager = ServerManager::new(config, hub)?;
    manager.connect_daemons().await;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(command) => {
                if !execute(&manager, command).await {
                    break;
                }
            }
            None => println!("Unknown command. {}", HELP),
        }
    }

    manager.shutdown().await;
    tracing::info!("mcga-core shutting down");
    Ok(())
}
