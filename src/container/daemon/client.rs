//! Controller end of one daemon connection.
//!
//! A background task keeps the connection alive: connect, read until the
//! socket dies, wait a fixed backoff, try again. The last reported process
//! state is kept as a replica so `is_process_running()` never blocks.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::ControlError;
use crate::protocol::{Message, ProcessState};

/// What the client observed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    Connected,
    ProcessState(ProcessState),
    Output(String),
    ConnectionLost,
}

/// Write side of the current connection. Cancelling `dropped` ends its
/// read loop.
struct Connection {
    writer: OwnedWriteHalf,
    dropped: CancellationToken,
}

struct ClientShared {
    server: String,
    addr: SocketAddr,
    backoff: Duration,
    healthy: AtomicBool,
    running: AtomicBool,
    connection: Mutex<Option<Connection>>,
    connect_lock: Mutex<()>,
    events: mpsc::UnboundedSender<DaemonEvent>,
}

pub struct DaemonClient {
    shared: Arc<ClientShared>,
    cancel: CancellationToken,
}

impl DaemonClient {
    /// Start connecting to the daemon on `127.0.0.1:port`. Must be called
    /// from within a tokio runtime.
    pub fn connect(
        server: &str,
        port: u16,
        backoff: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<DaemonEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            server: server.to_string(),
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            backoff,
            healthy: AtomicBool::new(false),
            running: AtomicBool::new(false),
            connection: Mutex::new(None),
            connect_lock: Mutex::new(()),
            events,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(shared.clone().run(cancel.clone()));

        (Self { shared, cancel }, rx)
    }

    pub fn server(&self) -> &str {
        &self.shared.server
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Last process state reported by the daemon.
    pub fn is_process_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_connection_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::SeqCst)
    }

    /// Write one message to the daemon.
    pub async fn send(&self, msg: &Message) -> Result<(), ControlError> {
        self.shared.send(msg).await
    }

    /// Stop the background task and drop the connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.shared.healthy.store(false, Ordering::SeqCst);
        if let Some(mut conn) = self.shared.connection.lock().await.take() {
            let _ = conn.writer.shutdown().await;
        }
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ClientShared {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if let Some((read_half, dropped)) = self.try_connect().await {
                let cancelled = self.read_loop(read_half, &dropped, &cancel).await;
                if cancelled {
                    break;
                }
                self.mark_lost().await;
            }

            tracing::info!(
                "[{}] Reconnecting to daemon in {}s",
                self.server,
                self.backoff.as_secs_f32()
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
        tracing::debug!("[{}] Daemon client stopped", self.server);
    }

    /// One connection attempt. Skipped when a healthy connection exists.
    async fn try_connect(&self) -> Option<(OwnedReadHalf, CancellationToken)> {
        let _guard = self.connect_lock.lock().await;
        if self.healthy.load(Ordering::SeqCst) {
            tracing::debug!("[{}] Already connected, skipping attempt", self.server);
            return None;
        }

        match TcpStream::connect(self.addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (read_half, write_half) = stream.into_split();
                let dropped = CancellationToken::new();
                *self.connection.lock().await = Some(Connection {
                    writer: write_half,
                    dropped: dropped.clone(),
                });
                self.healthy.store(true, Ordering::SeqCst);
                tracing::info!("[{}] Connected to daemon at {}", self.server, self.addr);
                let _ = self.events.send(DaemonEvent::Connected);
                Some((read_half, dropped))
            }
            Err(e) => {
                tracing::warn!(
                    "[{}] Failed to connect to daemon at {}: {}",
                    self.server,
                    self.addr,
                    e
                );
                None
            }
        }
    }

    /// Returns `true` when stopped by cancellation rather than by the socket.
    async fn read_loop(
        &self,
        read_half: OwnedReadHalf,
        dropped: &CancellationToken,
        cancel: &CancellationToken,
    ) -> bool {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return true,
                _ = dropped.cancelled() => return false,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => self.handle_line(&line),
                Ok(None) => {
                    tracing::warn!("[{}] Daemon closed the connection", self.server);
                    return false;
                }
                Err(e) => {
                    tracing::warn!("[{}] Daemon read error: {}", self.server, e);
                    return false;
                }
            }
        }
    }

    fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        match Message::decode(line) {
            Ok(Message::ProcessState(state)) => {
                self.running.store(state.is_running(), Ordering::SeqCst);
                let _ = self.events.send(DaemonEvent::ProcessState(state));
            }
            Ok(Message::ReceivedStdio(text)) => {
                tracing::debug!("[{}] {}", self.server, text);
                let _ = self.events.send(DaemonEvent::Output(text));
            }
            Ok(other) => {
                tracing::warn!(
                    "[{}] Unexpected {} message from daemon",
                    self.server,
                    other.type_code()
                );
            }
            Err(e) => {
                tracing::warn!("[{}] Malformed daemon line {:?}: {}", self.server, line, e);
            }
        }
    }

    async fn mark_lost(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        self.connection.lock().await.take();
        let _ = self.events.send(DaemonEvent::ConnectionLost);
    }

    async fn send(&self, msg: &Message) -> Result<(), ControlError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(ControlError::ConnectionUnhealthy(self.server.clone()));
        }
        let mut guard = self.connection.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ControlError::ConnectionUnhealthy(self.server.clone()))?;

        tracing::debug!("[{}] -> {}", self.server, msg);
        let line = msg.encode_line();
        let result = match conn.writer.write_all(line.as_bytes()).await {
            Ok(()) => conn.writer.flush().await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            tracing::warn!("[{}] Write to daemon failed: {}", self.server, e);
            // 쓰기 실패 = 연결 끊김; 읽기 루프가 ConnectionLost 후 재연결
            self.healthy.store(false, Ordering::SeqCst);
            if let Some(conn) = guard.take() {
                conn.dropped.cancel();
            }
            ControlError::WriteFailed {
                target: self.server.clone(),
                reason: e.to_string(),
            }
        })
    }
}
