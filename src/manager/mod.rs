//! Server manager: one container per configured server, created lazily and
//! kept for the life of the manager.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{ConfigError, ContainerMode, ControlSettings, GlobalConfig, ServerConfig};
use crate::container::{build_container, wait_for_state, ServerContainer};
use crate::error::ControlError;
use crate::event::{EventHub, OutputClassifier};
use crate::protocol::ProcessState;

/// One row of [`ServerManager::list_servers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub mode: ContainerMode,
    pub running: bool,
}

pub struct ServerManager {
    servers: Vec<ServerConfig>,
    settings: ControlSettings,
    classifier: Arc<OutputClassifier>,
    hub: Arc<EventHub>,
    containers: Mutex<HashMap<String, Arc<dyn ServerContainer>>>,
}

impl ServerManager {
    pub fn new(config: GlobalConfig, hub: Arc<EventHub>) -> Result<Self, ConfigError> {
        let classifier = OutputClassifier::new(&config.control.started_banner)?;
        Ok(Self {
            servers: config.servers,
            settings: config.control,
            classifier: Arc::new(classifier),
            hub,
            containers: Mutex::new(HashMap::new()),
        })
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    fn server_config(&self, name: &str) -> Result<&ServerConfig, ControlError> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ControlError::ServerNotFound(name.to_string()))
    }

    /// Get the container for `name`, creating it on first use.
    pub async fn container(&self, name: &str) -> Result<Arc<dyn ServerContainer>, ControlError> {
        let config = self.server_config(name)?;
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get(name) {
            return Ok(container.clone());
        }

        tracing::info!("[{}] Creating {:?} container", name, config.mode());
        let container = build_container(
            config.clone(),
            &self.settings,
            self.classifier.clone(),
            self.hub.clone(),
        );
        containers.insert(name.to_string(), container.clone());
        Ok(container)
    }

    /// Create every daemon-mode container now so their replicas start
    /// converging before the first request.
    pub async fn connect_daemons(&self) {
        for server in &self.servers {
            if matches!(server.mode(), ContainerMode::Daemon { .. }) {
                // name comes from our own list
                let _ = self.container(&server.name).await;
            }
        }
    }

    /// Start `name` and wait until it is confirmed running.
    pub async fn start_server(&self, name: &str) -> Result<(), ControlError> {
        let container = self.container(name).await?;
        tracing::info!("[{}] Starting server", name);
        container.start().await?;
        wait_for_state(container.as_ref(), ProcessState::Running, &self.settings).await
    }

    /// Stop `name` and wait until it is confirmed idle.
    pub async fn stop_server(&self, name: &str) -> Result<(), ControlError> {
        let container = self.container(name).await?;
        tracing::info!("[{}] Stopping server", name);
        container.stop().await?;
        wait_for_state(container.as_ref(), ProcessState::Idle, &self.settings).await
    }

    pub async fn send_command(&self, name: &str, text: &str) -> Result<(), ControlError> {
        self.container(name).await?.send_command(text).await
    }

    pub async fn is_server_running(&self, name: &str) -> Result<bool, ControlError> {
        Ok(self.container(name).await?.is_running())
    }

    /// Broadcast chat lines to every player as `tellraw` commands.
    pub async fn send_chat_message<S: AsRef<str>>(
        &self,
        name: &str,
        lines: &[S],
    ) -> Result<(), ControlError> {
        let container = self.container(name).await?;
        for line in lines {
            container.send_command(&tellraw_command(line.as_ref())).await?;
        }
        Ok(())
    }

    /// Configured servers in configuration order. Servers without a
    /// container yet are reported idle.
    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let containers = self.containers.lock().await;
        self.servers
            .iter()
            .map(|server| ServerStatus {
                name: server.name.clone(),
                mode: server.mode(),
                running: containers
                    .get(&server.name)
                    .map_or(false, |c| c.is_running()),
            })
            .collect()
    }

    /// Release all containers' background resources.
    pub async fn shutdown(&self) {
        let containers: Vec<_> = self.containers.lock().await.drain().collect();
        for (name, container) in containers {
            tracing::debug!("[{}] Closing container", name);
            container.close().await;
        }
    }
}

fn tellraw_command(text: &str) -> String {
    format!("tellraw @a {}", serde_json::json!({ "text": text }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(servers: Vec<ServerConfig>) -> ServerManager {
        let config = GlobalConfig {
            control: ControlSettings::default(),
            servers,
        };
        ServerManager::new(config, Arc::new(EventHub::new())).unwrap()
    }

    #[test]
    fn test_tellraw_escapes_text() {
        assert_eq!(
            tellraw_command(r#"say "hi""#),
            r#"tellraw @a {"text":"say \"hi\""}"#
        );
    }

    #[tokio::test]
    async fn test_unknown_server_is_not_found() {
        let manager = manager(vec![]);
        assert!(matches!(
            manager.start_server("ghost").await.unwrap_err(),
            ControlError::ServerNotFound(_)
        ));
        assert!(matches!(
            manager.is_server_running("ghost").await.unwrap_err(),
            ControlError::ServerNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_container_is_created_once() {
        let manager = manager(vec![ServerConfig::new("a", ".", &["true"])]);
        let first = manager.container("a").await.unwrap();
        let second = manager.container("a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_list_servers_reports_modes() {
        let manager = manager(vec![
            ServerConfig::new("embedded", ".", &["true"]),
            ServerConfig::new("remote", ".", &["true"]).with_daemon_port(1),
        ]);
        manager.connect_daemons().await;

        let rows = manager.list_servers().await;
        assert_eq!(
            rows,
            vec![
                ServerStatus {
                    name: "embedded".into(),
                    mode: ContainerMode::Embedded,
                    running: false,
                },
                ServerStatus {
                    name: "remote".into(),
                    mode: ContainerMode::Daemon { port: 1 },
                    running: false,
                },
            ]
        );
        manager.shutdown().await;
    }

    #[test]
    fn test_invalid_banner_is_rejected() {
        let mut control = ControlSettings::default();
        control.started_banner = "(".into();
        let config = GlobalConfig {
            control,
            servers: vec![],
        };
        assert!(ServerManager::new(config, Arc::new(EventHub::new())).is_err());
    }
}
