mod read_buffer;
pub use read_buffer::*;
mod channel_stream;
pub use channel_stream::*;
mod demuxer;
pub use demuxer::*;

use tokio_util::sync::CancellationToken;

pub(crate) type ChannelFrame = std::io::Result<Vec<u8>>;
pub(crate) type OutboundFrame = (u8, Vec<u8>);

/// Cancels the connection pumps when the last stream referencing it is dropped.
pub(crate) struct ConnectionGuard {
    token: CancellationToken,
}

impl ConnectionGuard {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
