//! Shared helpers for the integration tests.

use std::net::TcpListener as StdTcpListener;

/// Reserve an ephemeral loopback port and return its `host:port` string.
/// The reservation is released before returning; a real bind happens
/// moments later when the test's own [`forward_proxy::core::Listener`]
/// starts, which is an acceptable race for test purposes.
#[allow(dead_code)]
pub fn reserve_loopback_addr() -> String {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("reserve ephemeral port");
    listener.local_addr().expect("local_addr").to_string()
}
