//! TCP tuning and forced-close helpers.

use std::net::Shutdown;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Keepalive period applied to HTTP `Proxy-Connection: keep-alive`
/// tunnels and to every accepted connection when configured.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Enable low-latency options on a TCP stream (best-effort).
pub fn configure_tcp_stream(stream: &TcpStream, context: &str) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("[Net] Failed to enable TCP_NODELAY for {}: {}", context, err);
    }
}

/// Enable TCP keepalive with [`KEEPALIVE_PERIOD`].
/// Best-effort: a failure here never aborts the connection.
pub fn set_keepalive(stream: &TcpStream, context: &str) {
    use socket2::{SockRef, TcpKeepalive};

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    #[cfg(not(any(target_os = "openbsd", target_os = "redox", target_os = "solaris")))]
    let keepalive = keepalive.with_interval(Duration::from_secs(30));

    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("[Net] Failed to configure TCP keepalive for {}: {}", context, err);
    }
}

/// Forcibly unblock any in-flight read/write on `stream` by shutting
/// down both directions of the underlying socket. A closed
/// `Arc<TcpStream>` handle alone does not interrupt a sibling task's
/// in-progress `read`/`write` on the same fd, so the pump's
/// close-exactly-once path calls this directly.
pub fn force_close(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.shutdown(Shutdown::Both);
}
