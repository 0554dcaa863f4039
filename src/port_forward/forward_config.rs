use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use serde::*;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_SENTINEL: &str = "<EOF>";

/// What the copy loop does with upstream data while no local peer is connected.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoPeerPolicy {
    /// Discard the chunk and log a warning.
    #[default]
    Drop,
    /// End the session with `ForwardError::NoActivePeer`.
    FailSession,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ForwardConfig {
    pub bind_address: IpAddr,
    pub chunk_size: usize,
    /// In-band marker ending the inbound direction of a local connection.
    /// Matched per read chunk, so it can trigger on binary payloads and is missed
    /// when split across two reads. `None` disables it.
    pub sentinel: Option<String>,
    /// How long a local peer may go without moving bytes in either direction
    /// before it is dropped. Also bounds a single write to the peer.
    pub peer_io_timeout: Option<Duration>,
    pub no_peer_policy: NoPeerPolicy,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            chunk_size: DEFAULT_CHUNK_SIZE,
            sentinel: Some(DEFAULT_SENTINEL.to_string()),
            peer_io_timeout: None,
            no_peer_policy: NoPeerPolicy::Drop,
        }
    }
}

impl ForwardConfig {
    pub fn without_sentinel(mut self) -> Self {
        self.sentinel = None;
        self
    }

    pub fn with_peer_io_timeout(mut self, timeout: Duration) -> Self {
        self.peer_io_timeout = Some(timeout);
        self
    }

    pub fn with_no_peer_policy(mut self, policy: NoPeerPolicy) -> Self {
        self.no_peer_policy = policy;
        self
    }

    pub(crate) fn sentinel_bytes(&self) -> Option<&[u8]> {
        self.sentinel
            .as_deref()
            .filter(|sentinel| !sentinel.is_empty())
            .map(str::as_bytes)
    }

    pub(crate) fn effective_chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }
}

/// Position of the first sentinel occurrence inside one received chunk.
pub fn find_sentinel(chunk: &[u8], sentinel: &[u8]) -> Option<usize> {
    if sentinel.is_empty() || chunk.len() < sentinel.len() {
        return None;
    }

    chunk
        .windows(sentinel.len())
        .position(|window| window == sentinel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_sentinel() {
        assert_eq!(Some(5), find_sentinel(b"hello<EOF>", b"<EOF>"));
        assert_eq!(Some(0), find_sentinel(b"<EOF>tail", b"<EOF>"));
        assert_eq!(None, find_sentinel(b"hello<eof>", b"<EOF>"));
        assert_eq!(None, find_sentinel(b"<EO", b"<EOF>"));
        assert_eq!(None, find_sentinel(b"anything", b""));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ForwardConfig = serde_json::from_str(
            r#"{"chunk_size": 1024, "sentinel": null, "no_peer_policy": "fail_session"}"#,
        )
        .unwrap();

        assert_eq!(1024, config.chunk_size);
        assert!(config.sentinel_bytes().is_none());
        assert_eq!(NoPeerPolicy::FailSession, config.no_peer_policy);
        assert_eq!(IpAddr::V4(Ipv4Addr::LOCALHOST), config.bind_address);
        assert!(config.peer_io_timeout.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = ForwardConfig::default();
        assert_eq!(Some(b"<EOF>".as_slice()), config.sentinel_bytes());
        assert_eq!(DEFAULT_CHUNK_SIZE, config.effective_chunk_size());
        assert_eq!(NoPeerPolicy::Drop, config.no_peer_policy);
    }
}
