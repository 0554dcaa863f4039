use std::{net::SocketAddr, time::Duration};

use rust_extensions::StrOrString;
use tokio::{io::AsyncWriteExt, net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{BiStream, ClusterStreamProvider, ForwardConfig, ForwardError};

use super::{tcp_server, PeerSlot};

pub const DEFAULT_NAMESPACE: &str = "default";

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Which workload port to expose on which local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub pod_name: String,
    pub namespace: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardRequest {
    pub fn new(pod_name: impl Into<StrOrString<'static>>, local_port: u16, remote_port: u16) -> Self {
        let pod_name: StrOrString<'static> = pod_name.into();
        Self {
            pod_name: pod_name.as_str().to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            local_port,
            remote_port,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

/// Handle to a running forward session.
///
/// Dropping the handle stops the session without waiting for teardown.
pub struct ForwardHandle {
    request: ForwardRequest,
    local_addr: SocketAddr,
    token: CancellationToken,
    session: Option<JoinHandle<Result<(), ForwardError>>>,
}

impl ForwardHandle {
    pub fn request(&self) -> &ForwardRequest {
        &self.request
    }

    /// Address the local listener is bound to. Differs from the requested port when
    /// port 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        match &self.session {
            Some(session) => session.is_finished(),
            None => true,
        }
    }

    /// Stops both loops and waits for every owned resource to be released.
    ///
    /// Returns the fatal error if the session had already ended with one.
    pub async fn stop(mut self) -> Result<(), ForwardError> {
        self.token.cancel();
        self.join().await
    }

    /// Waits until the session ends on its own: upstream closed or a fatal error.
    pub async fn wait(mut self) -> Result<(), ForwardError> {
        self.join().await
    }

    /// Waits for the session without consuming the handle. Safe to race in
    /// `select!`: if the wait is dropped early, the handle can still be stopped
    /// and reports the outcome.
    pub async fn join(&mut self) -> Result<(), ForwardError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let result = session.await;
        self.session = None;

        match result {
            Ok(result) => result,
            Err(err) => Err(ForwardError::SessionPanicked(err.to_string())),
        }
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Binds the local listener, opens the upstream channel and starts relaying.
///
/// The listener is bound first, so a busy port fails with `BindFailed` without
/// touching the cluster. If the channel can not be opened the listener is released
/// before `ChannelUnavailable` is returned.
pub async fn start_forward(
    provider: &dyn ClusterStreamProvider,
    request: ForwardRequest,
    config: ForwardConfig,
) -> Result<ForwardHandle, ForwardError> {
    let bind_addr = SocketAddr::new(config.bind_address, request.local_port);

    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ForwardError::BindFailed {
            addr: bind_addr,
            source,
        })?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ForwardError::BindFailed {
            addr: bind_addr,
            source,
        })?;

    let upstream = match provider
        .open_port_forward_channel(&request.pod_name, &request.namespace, &[request.remote_port])
        .await
    {
        Ok(upstream) => upstream,
        Err(source) => {
            drop(listener);
            return Err(ForwardError::ChannelUnavailable {
                pod: request.pod_name.clone(),
                remote_port: request.remote_port,
                source,
            });
        }
    };

    tracing::info!(
        pod = %request.pod_name,
        namespace = %request.namespace,
        local = %local_addr,
        remote_port = request.remote_port,
        "Port forward started"
    );

    let token = CancellationToken::new();

    let session = tokio::spawn(run_session(
        listener,
        upstream,
        request.pod_name.clone(),
        config,
        token.clone(),
    ));

    Ok(ForwardHandle {
        request,
        local_addr,
        token,
        session: Some(session),
    })
}

async fn run_session(
    listener: TcpListener,
    upstream: BiStream,
    pod_name: String,
    config: ForwardConfig,
    token: CancellationToken,
) -> Result<(), ForwardError> {
    let BiStream { data, error, .. } = upstream;

    let error_drain = error.map(|error_channel| {
        tokio::spawn(tcp_server::drain_error_channel(
            error_channel,
            pod_name.clone(),
            token.clone(),
        ))
    });

    let peer_slot = PeerSlot::new();
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(data);

    let accept = async {
        let result = tcp_server::accept_loop(
            &listener,
            &mut upstream_writer,
            &peer_slot,
            &config,
            &token,
        )
        .await;
        token.cancel();
        result
    };

    let copy = async {
        let result =
            tcp_server::copy_loop(&mut upstream_reader, &peer_slot, &config, &token).await;
        token.cancel();
        result
    };

    let (accept_result, copy_result) = tokio::join!(accept, copy);

    // Teardown: runs once, after both loops have observed cancellation.
    if let Some(peer) = peer_slot.take().await {
        peer.shutdown().await;
    }

    drop(listener);

    let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, upstream_writer.shutdown()).await;
    drop(upstream_writer);
    drop(upstream_reader);

    if let Some(error_drain) = error_drain {
        let _ = error_drain.await;
    }

    let result = accept_result.and(copy_result);

    match &result {
        Ok(()) => tracing::info!(pod = %pod_name, "Port forward stopped"),
        Err(err) => tracing::error!(pod = %pod_name, kind = err.kind(), "Port forward failed: {}", err),
    }

    result
}
