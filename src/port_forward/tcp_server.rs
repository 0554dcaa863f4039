use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{tcp::OwnedReadHalf, TcpListener},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{BoxedReader, BoxedUpstream, ForwardConfig, ForwardError, NoPeerPolicy};

use super::{find_sentinel, PeerActivity, PeerSlot, PeerWrite};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

enum InboundEnd {
    PeerClosed,
    Sentinel,
    Cancelled,
}

/// Accepts local connections one at a time and relays each one's inbound bytes upstream.
///
/// Returns `Ok` on cancellation. Peer failures are contained; an upstream write
/// failure is returned as `ChannelIo`.
pub async fn accept_loop(
    listener: &TcpListener,
    upstream: &mut WriteHalf<BoxedUpstream>,
    peer_slot: &PeerSlot,
    config: &ForwardConfig,
    token: &CancellationToken,
) -> Result<(), ForwardError> {
    let mut buf = vec![0u8; config.effective_chunk_size()];
    let mut next_peer_id = 0u64;

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let (socket, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("Error accepting local connection: {}", err);
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                }
            }
        };

        next_peer_id += 1;
        let peer_id = next_peer_id;

        tracing::info!(peer = %addr, peer_id, "Accepted local connection");

        let (mut reader, writer) = socket.into_split();
        let activity = PeerActivity::new();

        if let Some(previous) = peer_slot
            .install(peer_id, addr, writer, activity.clone())
            .await
        {
            tracing::debug!(peer = %previous.addr, "Replacing previous local peer");
            previous.shutdown().await;
        }

        let inbound = relay_inbound(
            &mut reader,
            addr,
            &activity,
            upstream,
            &mut buf,
            config,
            token,
        );

        match inbound.await {
            Ok(InboundEnd::PeerClosed) => {
                tracing::debug!(peer = %addr, "Local peer finished sending");
            }
            Ok(InboundEnd::Sentinel) => {
                tracing::debug!(peer = %addr, "End-of-stream marker received from local peer");
            }
            Ok(InboundEnd::Cancelled) => return Ok(()),
            Err(ForwardError::PeerIo { peer, source }) => {
                tracing::warn!(peer = %peer, "Local connection dropped: {}", source);
                if let Some(peer) = peer_slot.remove(peer_id).await {
                    peer.shutdown().await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}

async fn relay_inbound(
    reader: &mut OwnedReadHalf,
    addr: SocketAddr,
    activity: &PeerActivity,
    upstream: &mut WriteHalf<BoxedUpstream>,
    buf: &mut [u8],
    config: &ForwardConfig,
    token: &CancellationToken,
) -> Result<InboundEnd, ForwardError> {
    let sentinel = config.sentinel_bytes();

    loop {
        let read = tokio::select! {
            _ = token.cancelled() => return Ok(InboundEnd::Cancelled),
            read = read_peer(reader, buf, activity, config.peer_io_timeout) => read,
        };

        let size = read.map_err(|source| ForwardError::PeerIo { peer: addr, source })?;

        if size == 0 {
            return Ok(InboundEnd::PeerClosed);
        }

        let chunk = &buf[..size];

        let (to_send, end) = match sentinel.and_then(|sentinel| find_sentinel(chunk, sentinel)) {
            Some(pos) => (&chunk[..pos], Some(InboundEnd::Sentinel)),
            None => (chunk, None),
        };

        if !to_send.is_empty() {
            if token.is_cancelled() {
                return Ok(InboundEnd::Cancelled);
            }

            let written = tokio::select! {
                _ = token.cancelled() => return Ok(InboundEnd::Cancelled),
                written = write_upstream(upstream, to_send) => written,
            };

            written.map_err(ForwardError::ChannelIo)?;
        }

        if let Some(end) = end {
            return Ok(end);
        }
    }
}

/// Reads from the peer. With a timeout, gives up only once neither direction of
/// the connection has moved bytes for that long.
async fn read_peer(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    activity: &PeerActivity,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let Some(timeout) = timeout else {
        return reader.read(buf).await;
    };

    loop {
        let deadline = activity.last() + timeout;

        if let Ok(result) = tokio::time::timeout_at(deadline, reader.read(buf)).await {
            if matches!(result, Ok(size) if size > 0) {
                activity.touch();
            }
            return result;
        }

        if activity.last() + timeout <= Instant::now() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "local peer made no progress in either direction",
            ));
        }
    }
}

async fn write_upstream(upstream: &mut WriteHalf<BoxedUpstream>, chunk: &[u8]) -> io::Result<()> {
    upstream.write_all(chunk).await?;
    upstream.flush().await
}

/// Moves upstream bytes to whichever local peer is current.
///
/// Returns `Ok` on cancellation or when the upstream reaches EOF.
pub async fn copy_loop(
    upstream: &mut ReadHalf<BoxedUpstream>,
    peer_slot: &PeerSlot,
    config: &ForwardConfig,
    token: &CancellationToken,
) -> Result<(), ForwardError> {
    let mut buf = vec![0u8; config.effective_chunk_size()];

    loop {
        let read = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = upstream.read(&mut buf) => read,
        };

        let size = read.map_err(ForwardError::ChannelIo)?;

        if size == 0 {
            tracing::info!("Upstream channel closed by remote side");
            return Ok(());
        }

        if token.is_cancelled() {
            return Ok(());
        }

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            written = peer_slot.write_chunk(&buf[..size], config.peer_io_timeout) => written,
        };

        match written {
            PeerWrite::Written(_) => {}
            PeerWrite::NoPeer => match config.no_peer_policy {
                NoPeerPolicy::Drop => {
                    tracing::warn!(
                        bytes = size,
                        "No local peer is connected. Dropping upstream data"
                    );
                }
                NoPeerPolicy::FailSession => return Err(ForwardError::NoActivePeer(size)),
            },
            PeerWrite::Evicted(addr) => {
                tracing::debug!(
                    peer = %addr,
                    bytes = size,
                    "Local peer replaced mid-write. Dropping chunk"
                );
            }
            PeerWrite::Failed(err) => {
                tracing::warn!("{}", err);
            }
        }
    }
}

/// Logs every report arriving on the upstream error channel until EOF or cancellation.
pub async fn drain_error_channel(
    mut error_channel: BoxedReader,
    pod_name: String,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; 4096];

    loop {
        let read = tokio::select! {
            _ = token.cancelled() => return,
            read = error_channel.read(&mut buf) => read,
        };

        match read {
            Ok(0) => return,
            Ok(size) => {
                tracing::warn!(
                    pod = %pod_name,
                    "Remote side reported: {}",
                    String::from_utf8_lossy(&buf[..size]).trim()
                );
            }
            Err(err) => {
                tracing::debug!(pod = %pod_name, "Error channel failed: {}", err);
                return;
            }
        }
    }
}
