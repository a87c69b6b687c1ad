//! Daemon mode: the child is owned by a `mcga-daemon` reached over loopback.

pub mod client;

pub use client::{DaemonClient, DaemonEvent};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ServerContainer;
use crate::config::ServerConfig;
use crate::error::ControlError;
use crate::event::{EventHub, OutputClassifier, ServerEvent};
use crate::protocol::Message;

pub struct DaemonContainer {
    config: ServerConfig,
    client: DaemonClient,
}

impl DaemonContainer {
    /// Start talking to the daemon on `config.daemon_port`. Must be called
    /// from within a tokio runtime.
    pub fn connect(
        config: ServerConfig,
        reconnect_backoff: Duration,
        classifier: Arc<OutputClassifier>,
        hub: Arc<EventHub>,
    ) -> Self {
        if config.daemon_port == 0 {
            tracing::warn!("[{}] Daemon container without a daemon port", config.name);
        }
        let (client, events) =
            DaemonClient::connect(&config.name, config.daemon_port, reconnect_backoff);
        tokio::spawn(publish_daemon_events(
            config.name.clone(),
            events,
            classifier,
            hub,
        ));
        Self { config, client }
    }

    pub fn client(&self) -> &DaemonClient {
        &self.client
    }

    fn ensure_healthy(&self) -> Result<(), ControlError> {
        if self.client.is_connection_healthy() {
            Ok(())
        } else {
            Err(ControlError::ConnectionUnhealthy(self.config.name.clone()))
        }
    }

    fn ensure_running(&self) -> Result<(), ControlError> {
        self.ensure_healthy()?;
        if self.client.is_process_running() {
            Ok(())
        } else {
            Err(ControlError::NotRunning(self.config.name.clone()))
        }
    }
}

#[async_trait]
impl ServerContainer for DaemonContainer {
    fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn start(&self) -> Result<(), ControlError> {
        self.ensure_healthy()?;
        if self.client.is_process_running() {
            return Err(ControlError::AlreadyRunning(self.config.name.clone()));
        }
        self.client
            .send(&Message::NewProcess {
                work_dir: self.config.working_dir.clone(),
                command: self.config.command.clone(),
            })
            .await
    }

    async fn stop(&self) -> Result<(), ControlError> {
        self.ensure_running()?;
        tracing::info!("[{}] Sending stop command to daemon", self.config.name);
        self.client
            .send(&Message::WriteStdio(self.config.stop_command.clone()))
            .await
    }

    async fn send_command(&self, text: &str) -> Result<(), ControlError> {
        self.ensure_running()?;
        self.client.send(&Message::WriteStdio(text.to_string())).await
    }

    fn is_running(&self) -> bool {
        self.client.is_process_running()
    }

    async fn close(&self) {
        self.client.shutdown().await;
    }
}

async fn publish_daemon_events(
    server: String,
    mut rx: mpsc::UnboundedReceiver<DaemonEvent>,
    classifier: Arc<OutputClassifier>,
    hub: Arc<EventHub>,
) {
    let mut was_running = false;
    while let Some(event) = rx.recv().await {
        match event {
            DaemonEvent::Connected => {
                tracing::info!("[{}] Daemon connection established", server);
            }
            DaemonEvent::ConnectionLost => {
                tracing::warn!("[{}] Daemon connection lost", server);
            }
            DaemonEvent::ProcessState(state) => {
                // Running → Idle 전환에서만 정지 이벤트
                if was_running && !state.is_running() {
                    hub.publish(&ServerEvent::ServerStopped {
                        server: server.clone(),
                    });
                }
                was_running = state.is_running();
            }
            DaemonEvent::Output(line) => {
                for event in classifier.classify(&server, &line) {
                    hub.publish(&event);
                }
            }
        }
    }
}
