use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::PollSender;

use super::{ChannelFrame, ConnectionGuard, OutboundFrame, ReadBuffer};

/// One logical sub-stream of a demultiplexed connection.
///
/// Reads return the payloads of frames received on `read_index`; writes are framed
/// onto `write_index`. A stream without a read index reads as EOF, a stream without
/// a write index fails writes with `BrokenPipe`. The connection stays open while at
/// least one stream of it is alive.
pub struct ChannelStream {
    reader: Option<mpsc::Receiver<ChannelFrame>>,
    read_buffer: ReadBuffer,
    writer: Option<(u8, PollSender<OutboundFrame>)>,
    _guard: Arc<ConnectionGuard>,
}

impl ChannelStream {
    pub(crate) fn new(
        reader: Option<mpsc::Receiver<ChannelFrame>>,
        writer: Option<(u8, mpsc::Sender<OutboundFrame>)>,
        guard: Arc<ConnectionGuard>,
    ) -> Self {
        Self {
            reader,
            read_buffer: ReadBuffer::new(),
            writer: writer.map(|(index, sender)| (index, PollSender::new(sender))),
            _guard: guard,
        }
    }
}

fn channel_closed(index: u8) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("channel {} is closed", index),
    )
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let self_mut = self.get_mut();

        loop {
            if !self_mut.read_buffer.is_empty() {
                let written = self_mut
                    .read_buffer
                    .write_to_buffer(buf.initialize_unfilled());
                buf.advance(written);
                return Poll::Ready(Ok(()));
            }

            let reader = match self_mut.reader.as_mut() {
                Some(reader) => reader,
                None => return Poll::Ready(Ok(())),
            };

            match ready!(reader.poll_recv(cx)) {
                Some(Ok(payload)) => self_mut.read_buffer.replace(payload),
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None => {
                    self_mut.reader = None;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let self_mut = self.get_mut();

        let (index, sender) = match self_mut.writer.as_mut() {
            Some((index, sender)) => (*index, sender),
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream has no write channel",
                )))
            }
        };

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if ready!(sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(channel_closed(index)));
        }

        if sender.send_item((index, buf.to_vec())).is_err() {
            return Poll::Ready(Err(channel_closed(index)));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some((_, sender)) = self.get_mut().writer.as_mut() {
            sender.close();
        }

        Poll::Ready(Ok(()))
    }
}
