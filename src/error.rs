use std::net::SocketAddr;

/// Errors reported by a port-forward session.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("can not bind local endpoint {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream channel for pod '{pod}' port {remote_port} is unavailable: {source}")]
    ChannelUnavailable {
        pod: String,
        remote_port: u16,
        #[source]
        source: ClusterStreamError,
    },

    #[error("i/o error on local peer {peer}: {source}")]
    PeerIo {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error on upstream channel: {0}")]
    ChannelIo(#[source] std::io::Error),

    #[error("upstream sent {0} bytes while no local peer is connected")]
    NoActivePeer(usize),

    #[error("forward session task terminated abnormally: {0}")]
    SessionPanicked(String),
}

/// Errors opening or driving a multiplexed channel to the cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterStreamError {
    #[error("invalid api endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("timeout opening channel")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("channel {0} is closed")]
    ChannelClosed(u8),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClusterStreamError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match error {
            Error::Io(err) => ClusterStreamError::Transport(err),
            Error::Http(response) => ClusterStreamError::Handshake(format!(
                "api server responded with http status {}",
                response.status()
            )),
            other => ClusterStreamError::Handshake(other.to_string()),
        }
    }
}

impl ForwardError {
    /// Short stable name of the error kind, used in user-facing messages and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::BindFailed { .. } => "BindFailed",
            ForwardError::ChannelUnavailable { .. } => "ChannelUnavailable",
            ForwardError::PeerIo { .. } => "PeerIOError",
            ForwardError::ChannelIo(_) => "ChannelIOError",
            ForwardError::NoActivePeer(_) => "NoActivePeer",
            ForwardError::SessionPanicked(_) => "SessionPanicked",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_distinct_per_kind() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let bind = ForwardError::BindFailed {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        let channel = ForwardError::ChannelUnavailable {
            pod: "web".to_string(),
            remote_port: 80,
            source: ClusterStreamError::Handshake("404".to_string()),
        };
        let no_peer = ForwardError::NoActivePeer(12);

        assert_eq!(
            "can not bind local endpoint 127.0.0.1:9000: in use",
            bind.to_string()
        );
        assert!(channel.to_string().contains("pod 'web' port 80"));
        assert_eq!(
            "upstream sent 12 bytes while no local peer is connected",
            no_peer.to_string()
        );

        assert_eq!("BindFailed", bind.kind());
        assert_eq!("ChannelUnavailable", channel.kind());
        assert_eq!("NoActivePeer", no_peer.kind());
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let err: ClusterStreamError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, ClusterStreamError::Transport(_)));
    }
}
