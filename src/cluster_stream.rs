use tokio::io::{AsyncRead, AsyncWrite};

use crate::ClusterStreamError;

/// Full-duplex byte stream usable as an upstream channel.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> UpstreamIo for T {}

pub type BoxedUpstream = Box<dyn UpstreamIo>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// Sub-streams of one multiplexed connection to the cluster.
///
/// `data` is the read/write pair the caller talks to. `error` carries remote-side
/// failure reports and must be drained by the consumer, but never waited on for
/// progress of `data`.
pub struct BiStream {
    pub data: BoxedUpstream,
    pub error: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
}

impl BiStream {
    pub fn new(data: impl UpstreamIo) -> Self {
        Self {
            data: Box::new(data),
            error: None,
            stderr: None,
        }
    }

    pub fn with_error(mut self, error: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }

    pub fn with_stderr(mut self, stderr: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }
}

/// Opens multiplexed channels into workloads running on the cluster.
#[async_trait::async_trait]
pub trait ClusterStreamProvider: Send + Sync {
    async fn open_pod_exec_channel(
        &self,
        pod_name: &str,
        namespace: &str,
        container_name: &str,
        command: &str,
    ) -> Result<BiStream, ClusterStreamError>;

    async fn open_port_forward_channel(
        &self,
        pod_name: &str,
        namespace: &str,
        remote_ports: &[u16],
    ) -> Result<BiStream, ClusterStreamError>;
}
