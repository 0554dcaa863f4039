use std::{
    collections::{HashMap, HashSet},
    io,
    sync::Arc,
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{ChannelFrame, ChannelStream, ConnectionGuard, OutboundFrame};

const CHANNEL_QUEUE_SIZE: usize = 64;
const PORT_PREFIX_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxMode {
    /// Frames carry exec stdio: stdin 0, stdout 1, stderr 2, error 3.
    Exec,
    /// The first frame of every channel starts with the little-endian port number.
    PortForward,
}

/// Splits one websocket connection speaking the `v4.channel.k8s.io` framing into
/// indexed sub-streams.
///
/// Streams are requested with [`ChannelDemuxer::get_stream`] before [`ChannelDemuxer::start`],
/// so no frame can arrive before its reader exists. Requesting the same read index
/// twice hands the channel to the later stream.
pub struct ChannelDemuxer<S> {
    ws: WebSocketStream<S>,
    mode: DemuxMode,
    subscribers: HashMap<u8, mpsc::Sender<ChannelFrame>>,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    outbound_rx: mpsc::Receiver<OutboundFrame>,
    guard: Arc<ConnectionGuard>,
}

impl<S> ChannelDemuxer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>, mode: DemuxMode) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_QUEUE_SIZE);
        Self {
            ws,
            mode,
            subscribers: HashMap::new(),
            outbound_tx,
            outbound_rx,
            guard: Arc::new(ConnectionGuard::new()),
        }
    }

    pub fn get_stream(&mut self, read_index: Option<u8>, write_index: Option<u8>) -> ChannelStream {
        let reader = read_index.map(|index| {
            let (sender, receiver) = mpsc::channel(CHANNEL_QUEUE_SIZE);
            self.subscribers.insert(index, sender);
            receiver
        });

        let writer = write_index.map(|index| (index, self.outbound_tx.clone()));

        ChannelStream::new(reader, writer, self.guard.clone())
    }

    /// Spawns the read and write pumps. The connection is closed once every stream
    /// obtained from this demuxer has been dropped.
    pub fn start(self) {
        let token = self.guard.token();
        let (sink, stream) = self.ws.split();

        tokio::spawn(write_loop(sink, self.outbound_rx, token.clone()));
        tokio::spawn(read_loop(stream, self.subscribers, self.mode, token));
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = outbound_rx.recv() => frame,
        };

        let (index, payload) = match frame {
            Some(frame) => frame,
            None => {
                // Every writer shut down; readers may still be draining.
                token.cancelled().await;
                break;
            }
        };

        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(index);
        data.extend_from_slice(&payload);

        if let Err(err) = sink.send(Message::Binary(data)).await {
            tracing::debug!(channel = index, "Error writing websocket frame: {}", err);
            break;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut subscribers: HashMap<u8, mpsc::Sender<ChannelFrame>>,
    mode: DemuxMode,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut port_prefix_seen = HashSet::new();

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(data))) => {
                let Some((index, payload)) = split_frame(&data, mode, &mut port_prefix_seen)
                else {
                    continue;
                };

                let Some(sender) = subscribers.get(&index) else {
                    tracing::trace!(channel = index, "Dropping frame for unsubscribed channel");
                    continue;
                };

                let delivered = tokio::select! {
                    _ = token.cancelled() => break,
                    result = sender.send(Ok(payload)) => result.is_ok(),
                };

                if !delivered {
                    subscribers.remove(&index);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!("Remote closed multiplexed connection: {:?}", frame);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::debug!("Multiplexed connection failed: {}", err);
                for sender in subscribers.values() {
                    let _ = sender.try_send(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        err.to_string(),
                    )));
                }
                break;
            }
            None => break,
        }
    }

    subscribers.clear();
}

/// Returns the channel index and the payload of a frame, with the port prefix
/// removed from the first frame of each channel in port-forward mode.
fn split_frame(
    data: &[u8],
    mode: DemuxMode,
    port_prefix_seen: &mut HashSet<u8>,
) -> Option<(u8, Vec<u8>)> {
    let (index, mut payload) = data.split_first().map(|(index, rest)| (*index, rest))?;

    if mode == DemuxMode::PortForward && port_prefix_seen.insert(index) {
        if payload.len() < PORT_PREFIX_SIZE {
            return None;
        }
        let port = u16::from_le_bytes([payload[0], payload[1]]);
        tracing::trace!(channel = index, port, "Port-forward channel announced");
        payload = &payload[PORT_PREFIX_SIZE..];
    }

    if payload.is_empty() {
        return None;
    }

    Some((index, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use futures::{SinkExt, StreamExt};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

    use super::*;

    #[test]
    fn test_split_frame_strips_port_prefix_once_per_channel() {
        let mut seen = HashSet::new();

        let first = split_frame(&[0, 0x90, 0x1f], DemuxMode::PortForward, &mut seen);
        assert!(first.is_none());

        let second = split_frame(&[0, b'h', b'i'], DemuxMode::PortForward, &mut seen);
        assert_eq!(Some((0, b"hi".to_vec())), second);

        let error_channel =
            split_frame(&[1, 0x90, 0x1f, b'e', b'r', b'r'], DemuxMode::PortForward, &mut seen);
        assert_eq!(Some((1, b"err".to_vec())), error_channel);
    }

    #[test]
    fn test_split_frame_exec_mode_keeps_payload() {
        let mut seen = HashSet::new();
        let frame = split_frame(&[1, 0x90, 0x1f], DemuxMode::Exec, &mut seen);
        assert_eq!(Some((1, vec![0x90, 0x1f])), frame);
        assert!(split_frame(&[], DemuxMode::Exec, &mut seen).is_none());
    }

    async fn connected_pair() -> (
        WebSocketStream<MaybeTlsStream<TcpStream>>,
        WebSocketStream<TcpStream>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(socket).await.unwrap()
        });

        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();

        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_routes_frames_by_channel_and_frames_writes() {
        let (client, mut server) = connected_pair().await;

        let mut demuxer = ChannelDemuxer::new(client, DemuxMode::PortForward);
        let mut data = demuxer.get_stream(Some(0), Some(0));
        let mut error = demuxer.get_stream(Some(1), None);
        demuxer.start();

        server.send(Message::Binary(vec![0, 0x50, 0x00])).await.unwrap();
        server.send(Message::Binary(vec![1, 0x50, 0x00])).await.unwrap();
        server
            .send(Message::Binary(b"\x00response".to_vec()))
            .await
            .unwrap();
        server
            .send(Message::Binary(b"\x01boom".to_vec()))
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        data.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"resp", &buf);
        data.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"onse", &buf);

        let mut err_buf = [0u8; 16];
        let read = error.read(&mut err_buf).await.unwrap();
        assert_eq!(b"boom", &err_buf[..read]);

        data.write_all(b"request").await.unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(Message::Binary(b"\x00request".to_vec()), frame);

        server.close(None).await.unwrap();

        let read = tokio::time::timeout(Duration::from_secs(5), data.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(0, read);
    }

    #[tokio::test]
    async fn test_write_only_stream_reads_eof_and_read_only_stream_rejects_writes() {
        let (client, _server) = connected_pair().await;

        let mut demuxer = ChannelDemuxer::new(client, DemuxMode::Exec);
        let mut stdin = demuxer.get_stream(None, Some(0));
        let mut error = demuxer.get_stream(Some(3), None);
        demuxer.start();

        let mut buf = [0u8; 8];
        assert_eq!(0, stdin.read(&mut buf).await.unwrap());

        let err = error.write_all(b"x").await.unwrap_err();
        assert_eq!(std::io::ErrorKind::BrokenPipe, err.kind());
    }

    #[tokio::test]
    async fn test_dropping_all_streams_closes_connection() {
        let (client, mut server) = connected_pair().await;

        let mut demuxer = ChannelDemuxer::new(client, DemuxMode::Exec);
        let stream = demuxer.get_stream(Some(1), Some(0));
        demuxer.start();

        drop(stream);

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match server.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;

        assert!(closed.is_ok());
    }
}
