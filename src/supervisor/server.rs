//! Loopback control listener of `mcga-daemon`.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use super::registry::Peer;
use super::worker::ProcessWorker;
use crate::protocol::Message;

/// Pending connections the OS may queue for us.
pub const LISTEN_BACKLOG: u32 = 50;

pub struct DaemonServer {
    listener: TcpListener,
    worker: Arc<ProcessWorker>,
    cancel: CancellationToken,
}

impl DaemonServer {
    /// Bind `127.0.0.1:port`. Port 0 picks a free port, see [`Self::local_addr`].
    pub async fn bind(
        port: u16,
        worker: Arc<ProcessWorker>,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        tracing::info!("Daemon listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            worker,
            cancel,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn worker(&self) -> &Arc<ProcessWorker> {
        &self.worker
    }

    /// Accept controllers until the cancellation token fires.
    pub async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    tracing::info!("Controller connected from {}", addr);
                    tokio::spawn(handle_connection(
                        self.worker.clone(),
                        stream,
                        addr,
                        self.cancel.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                }
            }
        }
        tracing::info!("Daemon listener stopped");
    }
}

async fn handle_connection(
    worker: Arc<ProcessWorker>,
    stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let registry = worker.registry().clone();

    let peer = Arc::new(Peer::new(registry.next_peer_id(), addr.to_string(), write_half));
    registry.register(&peer);

    // 접속 직후 현재 상태 1회 전송
    if let Err(e) = peer
        .send(&Message::ProcessState(worker.process_state()))
        .await
    {
        tracing::warn!("Failed to greet controller {}: {}", addr, e);
        registry.unregister(peer.id());
        return;
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = peer.closed() => {
                tracing::warn!("Dropping unresponsive controller {}", addr);
                break;
            }
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => handle_line(&worker, &line).await,
            Ok(None) => {
                tracing::info!("Controller {} disconnected", addr);
                break;
            }
            Err(e) => {
                tracing::warn!("Read error from controller {}: {}", addr, e);
                break;
            }
        }
    }

    registry.unregister(peer.id());
}

async fn handle_line(worker: &Arc<ProcessWorker>, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    tracing::debug!("<- {}", line);

    match Message::decode(line) {
        Ok(Message::NewProcess { work_dir, command }) => {
            if let Err(e) = worker.start_process(&command, &work_dir).await {
                tracing::warn!("Start request failed: {}", e);
            }
        }
        Ok(Message::WriteStdio(text)) => {
            // NotRunning / WriteFailed are logged by the worker
            let _ = worker.write_line(&text).await;
        }
        Ok(other) => {
            tracing::warn!("Ignoring {} message from controller", other.type_code());
        }
        Err(e) => {
            tracing::warn!("Malformed control line {:?}: {}", line, e);
        }
    }
}
