mod forward_sessions_pool;
pub use forward_sessions_pool::*;
mod forward_session;
pub use forward_session::*;
mod forward_config;
pub use forward_config::*;
mod peer_slot;
use peer_slot::*;
mod tcp_server;
