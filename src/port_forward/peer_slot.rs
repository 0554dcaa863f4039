use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf, sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::ForwardError;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Last moment bytes moved in either direction of one local connection.
#[derive(Clone)]
pub struct PeerActivity {
    started: Instant,
    elapsed_ms: Arc<AtomicU64>,
}

impl PeerActivity {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            elapsed_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.elapsed_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn last(&self) -> Instant {
        self.started + Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

pub struct ActivePeer {
    pub id: u64,
    pub addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    evicted: CancellationToken,
    activity: PeerActivity,
}

impl ActivePeer {
    /// Aborts a write in flight to this peer and closes its write half.
    pub async fn shutdown(self) {
        self.evicted.cancel();
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        })
        .await;
    }
}

pub enum PeerWrite {
    Written(SocketAddr),
    NoPeer,
    /// The peer was replaced or removed while the chunk was being written.
    Evicted(SocketAddr),
    Failed(ForwardError),
}

/// The single "current peer" of a session.
///
/// The accept loop installs and replaces the peer, the copy loop writes to it.
/// The slot lock only guards the handoff; writes run outside it and are aborted
/// when their peer is evicted. A failed write evicts the peer it was issued against.
pub struct PeerSlot {
    current: Mutex<Option<ActivePeer>>,
}

impl PeerSlot {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Makes the connection current and returns the peer it replaced. The
    /// replaced peer's pending write is aborted right away.
    pub async fn install(
        &self,
        id: u64,
        addr: SocketAddr,
        writer: OwnedWriteHalf,
        activity: PeerActivity,
    ) -> Option<ActivePeer> {
        let peer = ActivePeer {
            id,
            addr,
            writer: Arc::new(Mutex::new(writer)),
            evicted: CancellationToken::new(),
            activity,
        };

        let previous = self.current.lock().await.replace(peer);

        if let Some(previous) = &previous {
            previous.evicted.cancel();
        }

        previous
    }

    pub async fn remove(&self, id: u64) -> Option<ActivePeer> {
        let mut write_access = self.current.lock().await;
        match write_access.as_ref() {
            Some(peer) if peer.id == id => write_access.take(),
            _ => None,
        }
    }

    pub async fn take(&self) -> Option<ActivePeer> {
        self.current.lock().await.take()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.current.lock().await.is_none()
    }

    pub async fn write_chunk(&self, chunk: &[u8], timeout: Option<Duration>) -> PeerWrite {
        let (id, addr, writer, evicted, activity) = {
            let read_access = self.current.lock().await;
            match read_access.as_ref() {
                Some(peer) => (
                    peer.id,
                    peer.addr,
                    peer.writer.clone(),
                    peer.evicted.clone(),
                    peer.activity.clone(),
                ),
                None => return PeerWrite::NoPeer,
            }
        };

        let write = async {
            let mut writer = writer.lock().await;
            match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, writer.write_all(chunk)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timeout writing to local peer",
                    )),
                },
                None => writer.write_all(chunk).await,
            }
        };

        let result = tokio::select! {
            _ = evicted.cancelled() => return PeerWrite::Evicted(addr),
            result = write => result,
        };

        match result {
            Ok(()) => {
                activity.touch();
                PeerWrite::Written(addr)
            }
            Err(source) => {
                if let Some(peer) = self.remove(id).await {
                    peer.shutdown().await;
                }
                PeerWrite::Failed(ForwardError::PeerIo { peer: addr, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
    };

    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_no_peer_then_written() {
        let slot = PeerSlot::new();
        assert!(matches!(slot.write_chunk(b"x", None).await, PeerWrite::NoPeer));

        let (mut client, server) = socket_pair().await;
        let addr = server.peer_addr().unwrap();
        let (_reader, writer) = server.into_split();
        assert!(slot
            .install(1, addr, writer, PeerActivity::new())
            .await
            .is_none());

        assert!(matches!(
            slot.write_chunk(b"abc", None).await,
            PeerWrite::Written(_)
        ));

        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"abc", &buf);
    }

    #[tokio::test]
    async fn test_remove_only_matching_peer() {
        let slot = PeerSlot::new();

        let (_client1, server1) = socket_pair().await;
        let addr1 = server1.peer_addr().unwrap();
        let (_r1, w1) = server1.into_split();
        slot.install(1, addr1, w1, PeerActivity::new()).await;

        let (_client2, server2) = socket_pair().await;
        let addr2 = server2.peer_addr().unwrap();
        let (_r2, w2) = server2.into_split();
        let previous = slot
            .install(2, addr2, w2, PeerActivity::new())
            .await
            .unwrap();
        assert_eq!(1, previous.id);

        assert!(slot.remove(1).await.is_none());
        assert!(!slot.is_empty().await);
        assert_eq!(2, slot.remove(2).await.unwrap().id);
        assert!(slot.is_empty().await);
    }

    #[tokio::test]
    async fn test_install_aborts_write_to_stalled_peer() {
        let slot = Arc::new(PeerSlot::new());

        // The client never reads, so a large enough write can not complete.
        let (_stalled_client, server1) = socket_pair().await;
        let addr1 = server1.peer_addr().unwrap();
        let (_r1, w1) = server1.into_split();
        slot.install(1, addr1, w1, PeerActivity::new()).await;

        let writer_slot = slot.clone();
        let pending_write = tokio::spawn(async move {
            let chunk = vec![7u8; 32 * 1024 * 1024];
            writer_slot.write_chunk(&chunk, None).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let (_client2, server2) = socket_pair().await;
        let addr2 = server2.peer_addr().unwrap();
        let (_r2, w2) = server2.into_split();

        let previous = tokio::time::timeout(
            Duration::from_secs(5),
            slot.install(2, addr2, w2, PeerActivity::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(1, previous.id);

        let written = tokio::time::timeout(Duration::from_secs(5), pending_write)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(written, PeerWrite::Evicted(addr) if addr == addr1));
    }

    #[tokio::test]
    async fn test_failed_write_evicts_peer() {
        let slot = PeerSlot::new();

        let (client, server) = socket_pair().await;
        let addr = server.peer_addr().unwrap();
        let (_reader, writer) = server.into_split();
        slot.install(1, addr, writer, PeerActivity::new()).await;

        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);

        let mut failed = false;
        for _ in 0..50 {
            match slot.write_chunk(b"data", None).await {
                PeerWrite::Failed(ForwardError::PeerIo { peer, .. }) => {
                    assert_eq!(addr, peer);
                    failed = true;
                    break;
                }
                PeerWrite::Written(_) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                _ => panic!("unexpected write outcome"),
            }
        }

        assert!(failed);
        assert!(slot.is_empty().await);
    }

    #[tokio::test]
    async fn test_activity_moves_forward() {
        let activity = PeerActivity::new();
        let first = activity.last();

        tokio::time::sleep(Duration::from_millis(20)).await;
        activity.clone().touch();

        assert!(activity.last() > first);
    }
}
