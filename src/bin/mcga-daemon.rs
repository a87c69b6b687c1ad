//! Standalone supervisor: owns one game server process and serves
//! controllers on a loopback port.
//!
//! Usage: `mcga-daemon <port> [--no-stdin] [--config PATH] [--heartbeat-secs N]`
//!
//! The heartbeat period comes from `[control] heartbeat_interval_secs` in the
//! config file (`--config`, then `MCGA_CONFIG`, then `config/global.toml`);
//! `--heartbeat-secs` overrides it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mcga_core::config::{ControlSettings, GlobalConfig, DEFAULT_CONFIG_PATH};
use mcga_core::supervisor::{ConnectionRegistry, DaemonServer, ProcessWorker};

const USAGE: &str = "Usage: mcga-daemon <port> [--no-stdin] [--config PATH] [--heartbeat-secs N]";

struct DaemonArgs {
    port: u16,
    relay_stdin: bool,
    config: Option<String>,
    heartbeat: Option<Duration>,
}

impl DaemonArgs {
    fn config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("MCGA_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// CLI flag first, then the config file.
    fn heartbeat_interval(&self, control: &ControlSettings) -> Duration {
        self.heartbeat.unwrap_or(control.heartbeat_interval)
    }
}

fn parse_args(args: &[String]) -> anyhow::Result<DaemonArgs> {
    let mut port = None;
    let mut relay_stdin = true;
    let mut config = None;
    let mut heartbeat = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--no-stdin" => relay_stdin = false,
            "--config" => {
                config = Some(iter.next().context("--config needs a path")?.clone());
            }
            "--heartbeat-secs" => {
                let value = iter.next().context("--heartbeat-secs needs a value")?;
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid heartbeat seconds: {}", value))?;
                if secs == 0 {
                    bail!("Heartbeat interval must be at least 1 second");
                }
                heartbeat = Some(Duration::from_secs(secs));
            }
            other if other.starts_with("--") => bail!("Unknown option: {}", other),
            other => {
                if port.is_some() {
                    bail!("Unexpected argument: {}", other);
                }
                port = Some(
                    other
                        .parse::<u16>()
                        .with_context(|| format!("Invalid port: {}", other))?,
                );
            }
        }
    }

    Ok(DaemonArgs {
        port: port.context(USAGE)?,
        relay_stdin,
        config,
        heartbeat,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&args)?;
    let config_path = args.config_path();
    let config = GlobalConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let heartbeat_interval = args.heartbeat_interval(&config.control);
    if heartbeat_interval.is_zero() {
        bail!("heartbeat_interval_secs must be at least 1");
    }
    tracing::info!("Heartbeat every {:?}", heartbeat_interval);

    let cancel = CancellationToken::new();
    let worker = Arc::new(ProcessWorker::new(Arc::new(ConnectionRegistry::new())));
    let server = DaemonServer::bind(args.port, worker.clone(), cancel.clone())
        .await
        .with_context(|| format!("Failed to bind 127.0.0.1:{}", args.port))?;

    let heartbeat = worker.spawn_heartbeat(heartbeat_interval, cancel.clone());
    let relay = args
        .relay_stdin
        .then(|| worker.spawn_input_relay(tokio::io::stdin(), cancel.clone()));

    // Graceful shutdown: Ctrl+C 시 모든 태스크 취소
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    server.run().await;

    let _ = heartbeat.await;
    if let Some(relay) = relay {
        // stdin reads cannot be interrupted; don't wait for the relay
        relay.abort();
    }
    if worker.is_running() {
        tracing::warn!("Exiting while the child process is still running");
    }
    tracing::info!("mcga-daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_port_only() {
        let parsed = parse_args(&args(&["25585"])).unwrap();
        assert_eq!(parsed.port, 25585);
        assert!(parsed.relay_stdin);
        assert_eq!(parsed.config, None);
        assert_eq!(parsed.heartbeat, None);
    }

    #[test]
    fn test_parse_flags() {
        let parsed = parse_args(&args(&[
            "--no-stdin",
            "9000",
            "--config",
            "/etc/mcga.toml",
            "--heartbeat-secs",
            "3",
        ]))
        .unwrap();
        assert_eq!(parsed.port, 9000);
        assert!(!parsed.relay_stdin);
        assert_eq!(parsed.config.as_deref(), Some("/etc/mcga.toml"));
        assert_eq!(parsed.config_path(), "/etc/mcga.toml");
        assert_eq!(parsed.heartbeat, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_heartbeat_comes_from_config_unless_overridden() {
        let control = GlobalConfig::from_toml_str("[control]\nheartbeat_interval_secs = 25\n")
            .unwrap()
            .control;

        let from_config = parse_args(&args(&["9000"])).unwrap();
        assert_eq!(from_config.heartbeat_interval(&control), Duration::from_secs(25));

        let overridden = parse_args(&args(&["9000", "--heartbeat-secs", "2"])).unwrap();
        assert_eq!(overridden.heartbeat_interval(&control), Duration::from_secs(2));

        let defaults = ControlSettings::default();
        assert_eq!(from_config.heartbeat_interval(&defaults), Duration::from_secs(10));
    }

    #[test]
    fn test_config_file_sets_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.toml");
        std::fs::write(&path, "[control]\nheartbeat_interval_secs = 4\n").unwrap();

        let parsed = parse_args(&args(&["9000", "--config", path.to_str().unwrap()])).unwrap();
        let config = GlobalConfig::load(parsed.config_path()).unwrap();
        assert_eq!(parsed.heartbeat_interval(&config.control), Duration::from_secs(4));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["notaport"])).is_err());
        assert!(parse_args(&args(&["1", "2"])).is_err());
        assert!(parse_args(&args(&["1", "--heartbeat-secs"])).is_err());
        assert!(parse_args(&args(&["1", "--config"])).is_err());
        assert!(parse_args(&args(&["1", "--verbose"])).is_err());
    }
}
