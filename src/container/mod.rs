//! Uniform lifecycle interface over a server process, whoever owns it.
//!
//! - [`EmbeddedContainer`]: this process spawns the child itself
//! - [`DaemonContainer`]: a `mcga-daemon` owns the child, we talk to it over
//!   loopback TCP and keep a replica of its state
//!
//! `start`/`stop` only *request* a transition. Use [`wait_for_state`] to
//! confirm it.

pub mod daemon;
pub mod embedded;

pub use daemon::{DaemonClient, DaemonContainer, DaemonEvent};
pub use embedded::EmbeddedContainer;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::{ContainerMode, ControlSettings, ServerConfig};
use crate::error::ControlError;
use crate::event::{EventHub, OutputClassifier};
use crate::protocol::ProcessState;

#[async_trait]
pub trait ServerContainer: Send + Sync {
    fn config(&self) -> &ServerConfig;

    fn mode(&self) -> ContainerMode {
        self.config().mode()
    }

    /// Request a launch of the configured command.
    async fn start(&self) -> Result<(), ControlError>;

    /// Ask the server to shut down by sending its stop command.
    async fn stop(&self) -> Result<(), ControlError>;

    /// Send one console line to the running server.
    async fn send_command(&self, text: &str) -> Result<(), ControlError>;

    /// Current (embedded) or last reported (daemon) process state.
    fn is_running(&self) -> bool;

    /// Release background resources. The child itself is left alone.
    async fn close(&self) {}
}

/// Poll `container` until it reports `desired` or the configured timeout
/// elapses. State is never forced; on timeout it keeps converging on its own.
pub async fn wait_for_state(
    container: &dyn ServerContainer,
    desired: ProcessState,
    settings: &ControlSettings,
) -> Result<(), ControlError> {
    let started = Instant::now();
    let deadline = started + settings.state_timeout;
    loop {
        if container.is_running() == desired.is_running() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            tracing::warn!(
                "[{}] Gave up waiting for {:?} after {:?}",
                container.config().name,
                desired,
                settings.state_timeout
            );
            return Err(ControlError::StateTimeout {
                server: container.config().name.clone(),
                desired,
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(settings.state_poll_interval).await;
    }
}

/// Build the container variant selected by `config.daemon_port`.
pub fn build_container(
    config: ServerConfig,
    settings: &ControlSettings,
    classifier: Arc<OutputClassifier>,
    hub: Arc<EventHub>,
) -> Arc<dyn ServerContainer> {
    match config.mode() {
        ContainerMode::Embedded => Arc::new(EmbeddedContainer::new(config, classifier, hub)),
        ContainerMode::Daemon { .. } => Arc::new(DaemonContainer::connect(
            config,
            settings.reconnect_backoff,
            classifier,
            hub,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// A container whose state is flipped by the test.
    struct Scripted {
        config: ServerConfig,
        running: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ServerContainer for Scripted {
        fn config(&self) -> &ServerConfig {
            &self.config
        }
        async fn start(&self) -> Result<(), ControlError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), ControlError> {
            Ok(())
        }
        async fn send_command(&self, _text: &str) -> Result<(), ControlError> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn fast_settings() -> ControlSettings {
        ControlSettings {
            state_timeout: Duration::from_millis(300),
            state_poll_interval: Duration::from_millis(20),
            ..ControlSettings::default()
        }
    }

    fn scripted(running: bool) -> (Scripted, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(running));
        (
            Scripted {
                config: ServerConfig::new("s", ".", &["true"]),
                running: flag.clone(),
            },
            flag,
        )
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_there() {
        let (container, _) = scripted(true);
        wait_for_state(&container, ProcessState::Running, &fast_settings())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_sees_late_transition() {
        let (container, flag) = scripted(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            flag.store(true, Ordering::SeqCst);
        });
        wait_for_state(&container, ProcessState::Running, &fast_settings())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out_without_forcing_state() {
        let (container, _) = scripted(false);
        let err = wait_for_state(&container, ProcessState::Running, &fast_settings())
            .await
            .unwrap_err();
        match err {
            ControlError::StateTimeout { desired, waited, .. } => {
                assert_eq!(desired, ProcessState::Running);
                assert!(waited >= Duration::from_millis(300));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!container.is_running());
    }

    #[tokio::test]
    async fn test_build_container_picks_mode_from_port() {
        let settings = ControlSettings::default();
        let classifier = Arc::new(OutputClassifier::standard().unwrap());
        let hub = Arc::new(EventHub::new());

        let embedded = build_container(
            ServerConfig::new("a", ".", &["true"]),
            &settings,
            classifier.clone(),
            hub.clone(),
        );
        assert_eq!(embedded.mode(), ContainerMode::Embedded);

        let daemon = build_container(
            ServerConfig::new("b", ".", &["true"]).with_daemon_port(1),
            &settings,
            classifier,
            hub,
        );
        assert_eq!(daemon.mode(), ContainerMode::Daemon { port: 1 });
        assert!(!daemon.is_running());
        daemon.close().await;
    }
}
