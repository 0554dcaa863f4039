use std::time::Duration;

use futures::Future;
use rust_extensions::StrOrString;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{client::IntoClientRequest, http::HeaderValue},
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{BiStream, ChannelDemuxer, ClusterStreamError, ClusterStreamProvider, DemuxMode};

pub const CHANNEL_SUB_PROTOCOL: &str = "v4.channel.k8s.io";

pub const EXEC_STDIN_CHANNEL: u8 = 0;
pub const EXEC_STDOUT_CHANNEL: u8 = 1;
pub const EXEC_STDERR_CHANNEL: u8 = 2;
pub const EXEC_ERROR_CHANNEL: u8 = 3;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Location of the cluster API server and the credential to present to it.
#[derive(Debug, Clone)]
pub struct KubeApiEndpoint {
    pub base_url: String,
    pub bearer_token: Option<String>,
}

impl KubeApiEndpoint {
    pub fn new(base_url: impl Into<StrOrString<'static>>) -> Self {
        let base_url: StrOrString<'static> = base_url.into();
        Self {
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn port_forward_url(
        &self,
        pod_name: &str,
        namespace: &str,
        remote_ports: &[u16],
    ) -> Result<Url, ClusterStreamError> {
        let mut url = self.pod_url(pod_name, namespace, "portforward")?;
        {
            let mut query = url.query_pairs_mut();
            for port in remote_ports {
                query.append_pair("ports", &port.to_string());
            }
        }
        Ok(url)
    }

    pub fn exec_url(
        &self,
        pod_name: &str,
        namespace: &str,
        container_name: &str,
        command: &str,
    ) -> Result<Url, ClusterStreamError> {
        let mut url = self.pod_url(pod_name, namespace, "exec")?;
        {
            let mut query = url.query_pairs_mut();
            for word in command.split_whitespace() {
                query.append_pair("command", word);
            }
            query
                .append_pair("container", container_name)
                .append_pair("stdin", "false")
                .append_pair("stdout", "true")
                .append_pair("stderr", "true")
                .append_pair("tty", "false");
        }
        Ok(url)
    }

    fn pod_url(
        &self,
        pod_name: &str,
        namespace: &str,
        action: &str,
    ) -> Result<Url, ClusterStreamError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|_| ClusterStreamError::InvalidEndpoint(self.base_url.clone()))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            _ => return Err(ClusterStreamError::InvalidEndpoint(self.base_url.clone())),
        };

        url.set_scheme(scheme)
            .map_err(|_| ClusterStreamError::InvalidEndpoint(self.base_url.clone()))?;

        url.path_segments_mut()
            .map_err(|_| ClusterStreamError::InvalidEndpoint(self.base_url.clone()))?
            .pop_if_empty()
            .extend(&[
                "api",
                "v1",
                "namespaces",
                namespace,
                "pods",
                pod_name,
                action,
            ]);

        Ok(url)
    }
}

/// Opens exec and port-forward channels through the API server's websocket endpoints.
pub struct KubeStreamProvider {
    endpoint: KubeApiEndpoint,
    connect_timeout: Duration,
}

impl KubeStreamProvider {
    pub fn new(endpoint: KubeApiEndpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn endpoint(&self) -> &KubeApiEndpoint {
        &self.endpoint
    }

    async fn connect(
        &self,
        url: Url,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ClusterStreamError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ClusterStreamError::InvalidEndpoint(err.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(CHANNEL_SUB_PROTOCOL),
        );

        if let Some(token) = &self.endpoint.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                ClusterStreamError::InvalidEndpoint("bearer token is not a valid header".into())
            })?;
            headers.insert("Authorization", value);
        }

        tracing::debug!(url = %url, "Opening multiplexed channel");

        let future = async move {
            let (ws, _) = tokio_tungstenite::connect_async(request).await?;
            Ok::<_, ClusterStreamError>(ws)
        };

        execute_with_timeout(future, self.connect_timeout).await
    }
}

async fn execute_with_timeout<TResult>(
    future: impl Future<Output = Result<TResult, ClusterStreamError>>,
    timeout: Duration,
) -> Result<TResult, ClusterStreamError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(ClusterStreamError::Timeout),
    }
}

#[async_trait::async_trait]
impl ClusterStreamProvider for KubeStreamProvider {
    async fn open_pod_exec_channel(
        &self,
        pod_name: &str,
        namespace: &str,
        container_name: &str,
        command: &str,
    ) -> Result<BiStream, ClusterStreamError> {
        let url = self
            .endpoint
            .exec_url(pod_name, namespace, container_name, command)?;
        let ws = self.connect(url).await?;

        let mut demuxer = ChannelDemuxer::new(ws, DemuxMode::Exec);
        // Stdin is not requested: the protocol can not signal its end.
        let data = demuxer.get_stream(Some(EXEC_STDOUT_CHANNEL), None);
        let stderr = demuxer.get_stream(Some(EXEC_STDERR_CHANNEL), None);
        let error = demuxer.get_stream(Some(EXEC_ERROR_CHANNEL), None);
        demuxer.start();

        Ok(BiStream::new(data).with_error(error).with_stderr(stderr))
    }

    async fn open_port_forward_channel(
        &self,
        pod_name: &str,
        namespace: &str,
        remote_ports: &[u16],
    ) -> Result<BiStream, ClusterStreamError> {
        let url = self
            .endpoint
            .port_forward_url(pod_name, namespace, remote_ports)?;
        let ws = self.connect(url).await?;

        // Only the first requested port is exposed: data 0, error 1.
        let mut demuxer = ChannelDemuxer::new(ws, DemuxMode::PortForward);
        let data = demuxer.get_stream(Some(0), Some(0));
        let error = demuxer.get_stream(Some(1), None);
        demuxer.start();

        Ok(BiStream::new(data).with_error(error))
    }
}
