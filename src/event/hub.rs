//! In-process fan-out of [`ServerEvent`]s to independently registered
//! listeners (chat bridge, logging, ...).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use super::ServerEvent;

/// A consumer of server events. Returning an error only affects this
/// listener; delivery to the others continues.
pub trait ServerEventListener: Send + Sync {
    fn on_event(&self, event: &ServerEvent) -> anyhow::Result<()>;
}

impl<F> ServerEventListener for F
where
    F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) -> anyhow::Result<()> {
        self(event)
    }
}

#[derive(Default)]
pub struct EventHub {
    listeners: Mutex<HashMap<Uuid, Arc<dyn ServerEventListener>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<dyn ServerEventListener>>> {
        // a panicking listener never runs under this lock
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener and return its id for later removal.
    pub fn register(&self, listener: Arc<dyn ServerEventListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(id, listener);
        tracing::debug!("Registered event listener {}", id);
        id
    }

    pub fn unregister(&self, id: &Uuid) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to every listener registered at call time.
    pub fn publish(&self, event: &ServerEvent) {
        let snapshot: Vec<(Uuid, Arc<dyn ServerEventListener>)> = self
            .lock()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Listener {} failed on {}: {:#}", id, event.name(), e);
                }
                Err(_) => {
                    tracing::error!("Listener {} panicked on {}", id, event.name());
                }
            }
        }
    }
}

/// Writes every event to the tracing log.
pub struct LoggingListener;

impl ServerEventListener for LoggingListener {
    fn on_event(&self, event: &ServerEvent) -> anyhow::Result<()> {
        match event {
            ServerEvent::ServerStarted { server } => {
                tracing::info!("[{}] Server started", server)
            }
            ServerEvent::ServerStopped { server } => {
                tracing::info!("[{}] Server stopped", server)
            }
            ServerEvent::PlayerJoined { server, player } => {
                tracing::info!("[{}] {} joined", server, player)
            }
            ServerEvent::PlayerLeft { server, player } => {
                tracing::info!("[{}] {} left", server, player)
            }
            ServerEvent::PlayerMessage {
                server,
                player,
                message,
            } => tracing::info!("[{}] <{}> {}", server, player, message),
        }
        Ok(())
    }
}
