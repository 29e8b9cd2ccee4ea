//! SOCKS5 proxy protocol (RFC 1928/1929): frame codec (C1) and proxy
//! session state machine (C4).

pub mod frame;
pub mod session;

pub use frame::{Address, Command, ReplyCode};
pub use session::{Authenticator, Socks5Handler, StaticAuthenticator};
