//! HTTP/HTTPS forward proxy (C3): `CONNECT` tunnels and absolute-URI
//! forward requests.

pub mod session;

pub use session::HttpHandler;
