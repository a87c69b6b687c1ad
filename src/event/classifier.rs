//! Console line → domain event extraction.
//!
//! Every rule is evaluated against every line; a single line may yield
//! several events or none.

use regex::Regex;

use super::ServerEvent;

/// Vanilla/Paper completion banner, e.g.
/// `[12:00:00] [Server thread/INFO]: Done (5.123s)! For help, type "help"`
pub const DEFAULT_STARTED_BANNER: &str = r#"Done \(\d+(?:\.\d+)?s\)! For help, type "help""#;

const CHAT_PATTERN: &str = r"<([^<>\s]+)> (.+)$";
const JOIN_PATTERN: &str = r"(\S+) joined the game\s*$";
const LEAVE_PATTERN: &str = r"(\S+) left the game\s*$";

#[derive(Debug, Clone)]
pub struct OutputClassifier {
    started: Regex,
    chat: Regex,
    joined: Regex,
    left: Regex,
}

impl OutputClassifier {
    /// Build a classifier with a custom started banner pattern.
    pub fn new(started_banner: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            started: Regex::new(started_banner)?,
            chat: Regex::new(CHAT_PATTERN)?,
            joined: Regex::new(JOIN_PATTERN)?,
            left: Regex::new(LEAVE_PATTERN)?,
        })
    }

    /// Classifier with the vanilla/Paper started banner.
    pub fn standard() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_STARTED_BANNER)
    }

    pub fn classify(&self, server: &str, line: &str) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.started.is_match(line) {
            events.push(ServerEvent::ServerStarted {
                server: server.to_string(),
            });
        }

        if let Some(caps) = self.chat.captures(line) {
            events.push(ServerEvent::PlayerMessage {
                server: server.to_string(),
                player: caps[1].to_string(),
                message: caps[2].to_string(),
            });
        }

        if let Some(caps) = self.joined.captures(line) {
            events.push(ServerEvent::PlayerJoined {
                server: server.to_string(),
                player: caps[1].to_string(),
            });
        }

        if let Some(caps) = self.left.captures(line) {
            events.push(ServerEvent::PlayerLeft {
                server: server.to_string(),
                player: caps[1].to_string(),
            });
        }

        events
    }
}
