use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use tokio::sync::Mutex;

use crate::{ClusterStreamProvider, ForwardConfig, ForwardError, ForwardHandle, ForwardRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSessionInfo {
    pub local_addr: SocketAddr,
    pub request: ForwardRequest,
    pub finished: bool,
}

/// Running forward sessions, keyed by the local port they listen on.
pub struct ForwardSessionsPool {
    sessions: Mutex<BTreeMap<u16, ForwardHandle>>,
    provider: Arc<dyn ClusterStreamProvider>,
    config: ForwardConfig,
}

impl ForwardSessionsPool {
    pub fn new(provider: Arc<dyn ClusterStreamProvider>, config: ForwardConfig) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            provider,
            config,
        }
    }

    /// Starts a session and registers it under its bound port. A finished session
    /// previously registered on the same port is returned so the caller can collect
    /// its outcome.
    pub async fn add_forward(
        &self,
        request: ForwardRequest,
    ) -> Result<(SocketAddr, Option<ForwardHandle>), ForwardError> {
        let mut write_access = self.sessions.lock().await;

        let handle =
            crate::start_forward(self.provider.as_ref(), request, self.config.clone()).await?;

        let local_addr = handle.local_addr();
        let old_item = write_access.insert(local_addr.port(), handle);

        Ok((local_addr, old_item))
    }

    pub async fn find_session(
        &self,
        check: impl Fn(&ForwardRequest) -> bool,
    ) -> Option<ForwardSessionInfo> {
        let read_access = self.sessions.lock().await;
        read_access
            .values()
            .find(|handle| check(handle.request()))
            .map(session_info)
    }

    pub async fn list_sessions(&self) -> Vec<ForwardSessionInfo> {
        let read_access = self.sessions.lock().await;
        read_access.values().map(session_info).collect()
    }

    pub async fn remove_session(&self, local_port: u16) -> Option<ForwardHandle> {
        let mut write_access = self.sessions.lock().await;
        write_access.remove(&local_port)
    }

    pub async fn stop_session(&self, local_port: u16) -> Option<Result<(), ForwardError>> {
        let handle = self.remove_session(local_port).await?;
        Some(handle.stop().await)
    }

    pub async fn stop_all(&self) {
        let sessions = {
            let mut write_access = self.sessions.lock().await;
            std::mem::take(&mut *write_access)
        };

        for (port, handle) in sessions {
            if let Err(err) = handle.stop().await {
                tracing::warn!(local_port = port, "Forward session ended with error: {}", err);
            }
        }
    }
}

fn session_info(handle: &ForwardHandle) -> ForwardSessionInfo {
    ForwardSessionInfo {
        local_addr: handle.local_addr(),
        request: handle.request().clone(),
        finished: handle.is_finished(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        net::TcpStream,
    };

    use super::*;
    use crate::{BiStream, ClusterStreamError};

    struct DuplexProvider {
        remotes: StdMutex<Vec<DuplexStream>>,
    }

    #[async_trait::async_trait]
    impl ClusterStreamProvider for DuplexProvider {
        async fn open_pod_exec_channel(
            &self,
            _pod_name: &str,
            _namespace: &str,
            _container_name: &str,
            _command: &str,
        ) -> Result<BiStream, ClusterStreamError> {
            Err(ClusterStreamError::Handshake("not supported".to_string()))
        }

        async fn open_port_forward_channel(
            &self,
            _pod_name: &str,
            _namespace: &str,
            _remote_ports: &[u16],
        ) -> Result<BiStream, ClusterStreamError> {
            let (upstream, remote) = tokio::io::duplex(1024);
            self.remotes.lock().unwrap().push(remote);
            Ok(BiStream::new(upstream))
        }
    }

    #[tokio::test]
    async fn test_sessions_run_side_by_side() {
        let provider = Arc::new(DuplexProvider {
            remotes: StdMutex::new(Vec::new()),
        });
        let pool = ForwardSessionsPool::new(provider.clone(), ForwardConfig::default());

        let (web_addr, _) = pool
            .add_forward(ForwardRequest::new("web-0", 0, 80))
            .await
            .unwrap();
        let (db_addr, _) = pool
            .add_forward(ForwardRequest::new("db-0", 0, 5432).with_namespace("data"))
            .await
            .unwrap();

        assert_ne!(web_addr.port(), db_addr.port());
        assert_eq!(2, pool.list_sessions().await.len());

        let found = pool
            .find_session(|request| request.namespace == "data")
            .await
            .unwrap();
        assert_eq!(db_addr, found.local_addr);
        assert_eq!("db-0", found.request.pod_name);

        let mut client = TcpStream::connect(db_addr).await.unwrap();
        client.write_all(b"select").await.unwrap();

        let mut remote = provider.remotes.lock().unwrap().remove(1);
        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"select", &buf);

        assert!(pool.stop_session(web_addr.port()).await.unwrap().is_ok());
        assert!(pool.stop_session(web_addr.port()).await.is_none());

        pool.stop_all().await;
        assert!(pool.list_sessions().await.is_empty());
    }
}
