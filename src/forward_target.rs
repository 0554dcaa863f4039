use crate::{ForwardRequest, DEFAULT_NAMESPACE};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ForwardTargetError {
    #[error("invalid forward target '{0}'. Expected [namespace/]pod:local_port->remote_port")]
    Malformed(String),

    #[error("invalid port '{port}' in forward target '{target}'")]
    InvalidPort { target: String, port: String },
}

// Parses strings like "web-0:9000->8080", "apps/web-0:9000->8080" or "web-0:8080"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub namespace: String,
    pub pod_name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardTarget {
    pub fn parse(src: &str) -> Result<Self, ForwardTargetError> {
        let malformed = || ForwardTargetError::Malformed(src.to_string());

        let (workload, ports) = src.trim().rsplit_once(':').ok_or_else(malformed)?;

        let (namespace, pod_name) = match workload.split_once('/') {
            Some((namespace, pod_name)) => (namespace, pod_name),
            None => (DEFAULT_NAMESPACE, workload),
        };

        if namespace.is_empty() || pod_name.is_empty() || pod_name.contains('/') {
            return Err(malformed());
        }

        let (local_port, remote_port) = match ports.split_once("->") {
            Some((local, remote)) => (parse_port(src, local)?, parse_port(src, remote)?),
            None => {
                let port = parse_port(src, ports)?;
                (port, port)
            }
        };

        Ok(Self {
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            local_port,
            remote_port,
        })
    }

    pub fn to_request(&self) -> ForwardRequest {
        ForwardRequest::new(self.pod_name.clone(), self.local_port, self.remote_port)
            .with_namespace(self.namespace.as_str())
    }
}

fn parse_port(target: &str, value: &str) -> Result<u16, ForwardTargetError> {
    let value = value.trim();
    match value.parse() {
        Ok(port) => Ok(port),
        Err(_) => Err(ForwardTargetError::InvalidPort {
            target: target.to_string(),
            port: value.to_string(),
        }),
    }
}
