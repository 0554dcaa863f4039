use std::time::Duration;

use serde::*;
use tokio::io::AsyncReadExt;

use crate::{BiStream, BoxedReader, ClusterStreamError, ClusterStreamProvider};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("can not open exec channel: {0}")]
    Channel(#[from] ClusterStreamError),

    #[error("i/o error on exec channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("command did not finish within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Message of a `Failure` status reported on the error channel.
    pub failure: Option<String>,
}

impl ExecOutput {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

// Subset of the Kubernetes Status object sent on the exec error channel.
#[derive(Deserialize, Debug)]
struct ExecStatus {
    status: Option<String>,
    message: Option<String>,
}

/// Runs `command` in a container without stdin and collects its output.
///
/// Commands that read stdin see it closed at start.
pub async fn exec_in_pod(
    provider: &dyn ClusterStreamProvider,
    pod_name: &str,
    namespace: &str,
    container_name: &str,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutput, ExecError> {
    let future = async {
        let stream = provider
            .open_pod_exec_channel(pod_name, namespace, container_name, command)
            .await?;

        collect_output(stream).await
    };

    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout(timeout)),
    }
}

async fn collect_output(stream: BiStream) -> Result<ExecOutput, ExecError> {
    let BiStream {
        mut data,
        error,
        stderr,
    } = stream;

    let stdout = async {
        let mut result = Vec::new();
        data.read_to_end(&mut result).await?;
        Ok::<_, std::io::Error>(result)
    };

    let (stdout, stderr, status) =
        tokio::try_join!(stdout, read_to_end(stderr), read_to_end(error))?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        failure: parse_failure(&status),
    })
}

async fn read_to_end(reader: Option<BoxedReader>) -> std::io::Result<Vec<u8>> {
    let mut result = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut result).await?;
    }
    Ok(result)
}

fn parse_failure(status: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(status);
    let text = text.trim();

    if text.is_empty() {
        return None;
    }

    match serde_json::from_str::<ExecStatus>(text) {
        Ok(status) => match status.status.as_deref() {
            Some("Success") => None,
            _ => Some(
                status
                    .message
                    .unwrap_or_else(|| "command failed without a message".to_string()),
            ),
        },
        Err(_) => Some(text.to_string()),
    }
}
