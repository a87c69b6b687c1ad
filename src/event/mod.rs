pub mod classifier;
pub mod hub;

pub use classifier::{OutputClassifier, DEFAULT_STARTED_BANNER};
pub use hub::{EventHub, LoggingListener, ServerEventListener};

use serde::{Deserialize, Serialize};

/// Domain events extracted from a server's console output or lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    ServerStarted { server: String },
    ServerStopped { server: String },
    PlayerJoined { server: String, player: String },
    PlayerLeft { server: String, player: String },
    PlayerMessage { server: String, player: String, message: String },
}

impl ServerEvent {
    pub fn server(&self) -> &str {
        match self {
            Self::ServerStarted { server }
            | Self::ServerStopped { server }
            | Self::PlayerJoined { server, .. }
            | Self::PlayerLeft { server, .. }
            | Self::PlayerMessage { server, .. } => server,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerStarted { .. } => "ServerStarted",
            Self::ServerStopped { .. } => "ServerStopped",
            Self::PlayerJoined { .. } => "PlayerJoin",
            Self::PlayerLeft { .. } => "PlayerLeave",
            Self::PlayerMessage { .. } => "PlayerMessage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_tagging() {
        let event = ServerEvent::PlayerJoined {
            server: "survival".into(),
            player: "Bob".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "player_joined");
        assert_eq!(json["player"], "Bob");
        assert_eq!(event.server(), "survival");
        assert_eq!(event.name(), "PlayerJoin");
    }
}
