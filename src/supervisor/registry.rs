//! Connected controllers and fan-out of protocol lines to all of them.
//!
//! The registry only keeps `Weak` references. Each connection task owns its
//! [`Peer`]; when the task ends the peer disappears from broadcasts even if
//! explicit removal was missed.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::protocol::Message;

/// A peer that does not accept a line within this window is treated as dead.
pub const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub type PeerId = u64;

/// Write side of one controller connection.
pub struct Peer {
    id: PeerId,
    addr: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    closed: CancellationToken,
}

impl Peer {
    pub fn new<W>(id: PeerId, addr: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            addr: addr.into(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Write one encoded message and flush.
    pub async fn send(&self, msg: &Message) -> io::Result<()> {
        self.write_raw(&msg.encode_line(), PEER_WRITE_TIMEOUT).await
    }

    /// Ask the owning connection task to drop this connection. The
    /// controller then sees EOF and reconnects.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Completes once [`Self::close`] was called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn write_raw(&self, line: &str, timeout: Duration) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "peer write timed out")),
        }
    }
}

pub struct ConnectionRegistry {
    next_id: AtomicU64,
    write_timeout: Duration,
    peers: Mutex<Vec<(PeerId, Weak<Peer>)>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_write_timeout(PEER_WRITE_TIMEOUT)
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose broadcasts give up on a peer after `write_timeout`.
    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            write_timeout,
            peers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(PeerId, Weak<Peer>)>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn next_peer_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, peer: &Arc<Peer>) {
        tracing::info!("Registering controller {} (#{})", peer.addr(), peer.id());
        self.lock().push((peer.id(), Arc::downgrade(peer)));
    }

    /// Remove a peer. Returns `false` if it was already gone.
    pub fn unregister(&self, id: PeerId) -> bool {
        let mut peers = self.lock();
        let before = peers.len();
        peers.retain(|(peer_id, _)| *peer_id != id);
        let removed = peers.len() != before;
        if removed {
            tracing::info!("Unregistered controller #{}", id);
        }
        removed
    }

    /// Number of peers that are still alive.
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, peer)| peer.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `msg` to every registered peer. Failing peers are dropped from
    /// the registry and their connections closed; the rest still receive
    /// the line.
    pub async fn broadcast(&self, msg: &Message) {
        let line = msg.encode_line();

        // 동시 수정 방지를 위해 스냅샷 후 락 밖에서 전송
        let snapshot: Vec<(PeerId, Weak<Peer>)> = {
            let mut peers = self.lock();
            peers.retain(|(_, peer)| peer.strong_count() > 0);
            peers.clone()
        };

        for (id, weak) in snapshot {
            let Some(peer) = weak.upgrade() else {
                continue;
            };
            if let Err(e) = peer.write_raw(&line, self.write_timeout).await {
                tracing::warn!("Failed to write to controller {} (#{}): {}", peer.addr(), id, e);
                // 반쯤 쓰인 줄이 남았을 수 있으므로 연결 자체를 끊음
                self.unregister(id);
                peer.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProcessState;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn read_available(reader: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 256];
        let n = reader.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_broadcast_skips_broken_peer() {
        let registry = ConnectionRegistry::new();

        let (a_write, mut a_read) = tokio::io::duplex(1024);
        let (b_write, mut b_read) = tokio::io::duplex(1024);
        let a = Arc::new(Peer::new(registry.next_peer_id(), "a", a_write));
        let broken = Arc::new(Peer::new(registry.next_peer_id(), "broken", BrokenWriter));
        let b = Arc::new(Peer::new(registry.next_peer_id(), "b", b_write));

        registry.register(&a);
        registry.register(&broken);
        registry.register(&b);
        assert_eq!(registry.len(), 3);

        registry
            .broadcast(&Message::ReceivedStdio("hello".into()))
            .await;

        assert_eq!(read_available(&mut a_read).await, "RS,hello\n");
        assert_eq!(read_available(&mut b_read).await, "RS,hello\n");
        // broken peer removed and closed, live ones kept
        assert_eq!(registry.len(), 2);
        assert!(!registry.unregister(broken.id()));
        assert!(broken.is_closed());
        assert!(!a.is_closed());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (w, _r) = tokio::io::duplex(64);
        let peer = Arc::new(Peer::new(registry.next_peer_id(), "p", w));
        registry.register(&peer);

        assert!(registry.unregister(peer.id()));
        assert!(!registry.unregister(peer.id()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_does_not_own_peers() {
        let registry = ConnectionRegistry::new();
        let (w, _r) = tokio::io::duplex(64);
        let peer = Arc::new(Peer::new(registry.next_peer_id(), "p", w));
        registry.register(&peer);
        assert_eq!(Arc::strong_count(&peer), 1);

        drop(peer);
        assert_eq!(registry.len(), 0);
        // nothing to write to, nothing panics
        registry
            .broadcast(&Message::ProcessState(ProcessState::Idle))
            .await;
    }

    #[test]
    fn test_peer_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let a = registry.next_peer_id();
        let b = registry.next_peer_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out_and_is_closed() {
        let registry = ConnectionRegistry::with_write_timeout(Duration::from_millis(50));
        // tiny buffer that nobody reads
        let (write, _read) = tokio::io::duplex(8);
        let peer = Arc::new(Peer::new(registry.next_peer_id(), "stalled", write));
        registry.register(&peer);

        registry
            .broadcast(&Message::ReceivedStdio("a line longer than eight bytes".into()))
            .await;

        assert!(registry.is_empty());
        tokio::time::timeout(Duration::from_secs(1), peer.closed())
            .await
            .unwrap();
    }
}
