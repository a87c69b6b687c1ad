//! Supervisor side: a long-lived process that owns at most one child and
//! serves any number of controllers over loopback TCP.

pub mod registry;
pub mod server;
pub mod worker;

pub use registry::{ConnectionRegistry, Peer, PeerId};
pub use server::{DaemonServer, LISTEN_BACKLOG};
pub use worker::ProcessWorker;
