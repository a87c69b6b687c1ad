//! Embedded mode: the child lives and dies with the management process.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ServerContainer;
use crate::config::ServerConfig;
use crate::error::ControlError;
use crate::event::{EventHub, OutputClassifier, ServerEvent};
use crate::process::{ProcessPump, PumpEvent};

pub struct EmbeddedContainer {
    config: ServerConfig,
    classifier: Arc<OutputClassifier>,
    hub: Arc<EventHub>,
    pump: Mutex<Option<Arc<ProcessPump>>>,
}

impl EmbeddedContainer {
    pub fn new(config: ServerConfig, classifier: Arc<OutputClassifier>, hub: Arc<EventHub>) -> Self {
        Self {
            config,
            classifier,
            hub,
            pump: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ProcessPump>>> {
        self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The live pump, if the child is still running.
    fn running_pump(&self) -> Result<Arc<ProcessPump>, ControlError> {
        self.lock()
            .clone()
            .filter(|pump| pump.is_running())
            .ok_or_else(|| ControlError::NotRunning(self.config.name.clone()))
    }

    pub fn pid(&self) -> Option<u32> {
        self.running_pump().ok().and_then(|pump| pump.pid())
    }
}

#[async_trait]
impl ServerContainer for EmbeddedContainer {
    fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn start(&self) -> Result<(), ControlError> {
        let mut current = self.lock();
        if current.as_ref().map_or(false, |pump| pump.is_running()) {
            return Err(ControlError::AlreadyRunning(self.config.name.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(publish_pump_events(
            self.config.name.clone(),
            rx,
            self.classifier.clone(),
            self.hub.clone(),
        ));

        let pump = ProcessPump::spawn(
            &self.config.name,
            &self.config.command,
            &self.config.working_dir,
            tx,
        )?;
        *current = Some(Arc::new(pump));
        Ok(())
    }

    async fn stop(&self) -> Result<(), ControlError> {
        let pump = self.running_pump()?;
        tracing::info!("[{}] Sending stop command", self.config.name);
        pump.write_line(&self.config.stop_command).await
    }

    async fn send_command(&self, text: &str) -> Result<(), ControlError> {
        self.running_pump()?.write_line(text).await
    }

    fn is_running(&self) -> bool {
        self.lock().as_ref().map_or(false, |pump| pump.is_running())
    }
}

async fn publish_pump_events(
    server: String,
    mut rx: mpsc::UnboundedReceiver<PumpEvent>,
    classifier: Arc<OutputClassifier>,
    hub: Arc<EventHub>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            PumpEvent::Line { text, .. } => {
                tracing::debug!("[{}] {}", server, text);
                for event in classifier.classify(&server, &text) {
                    hub.publish(&event);
                }
            }
            PumpEvent::Stopped { .. } => {
                hub.publish(&ServerEvent::ServerStopped {
                    server: server.clone(),
                });
                break;
            }
        }
    }
}
