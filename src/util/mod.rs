//! Ambient network helpers shared by both proxy protocols.

pub mod dns;
pub mod net;

pub use dns::resolve_host;
pub use net::{configure_tcp_stream, force_close, set_keepalive};
