mod error;
pub use error::*;
mod cluster_stream;
pub use cluster_stream::*;
mod channel_demuxer;
pub use channel_demuxer::*;
mod kube_stream_provider;
pub use kube_stream_provider::*;
mod port_forward;
pub use port_forward::*;
mod forward_target;
pub use forward_target::*;
mod exec;
pub use exec::*;
