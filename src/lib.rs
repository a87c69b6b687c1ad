pub mod config;
pub mod container;
pub mod error;
pub mod event;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod supervisor;

pub use config::{ControlSettings, GlobalConfig, ServerConfig};
pub use container::{wait_for_state, ServerContainer};
pub use error::ControlError;
pub use event::{EventHub, ServerEvent};
pub use manager::ServerManager;
