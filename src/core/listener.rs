//! Listener / Connection Registry (C5): the accept loop shared by both
//! proxy protocols, parameterized over a [`ConnectionHandler`].

use crate::error::{ProxyError, Result};
use crate::util::net::{configure_tcp_stream, set_keepalive};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

/// A live Session's close capability, stored in the registry map. The
/// map never holds anything but this — Session internals are owned by
/// the task driving `negotiated.relay`.
pub type Closer = Arc<dyn Fn() + Send + Sync>;

pub struct SessionHandle {
    pub close: Closer,
}

/// Returned by a successful [`ConnectionHandler::negotiate`]: a handle
/// for the registry plus the future that runs the session's relay
/// phase to completion (the C2 pump, or the UDP-associate loop).
pub struct NegotiatedSession {
    pub handle: SessionHandle,
    pub relay: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// Protocol-specific negotiation logic (HTTP or SOCKS5). Mirrors the
/// teacher's `StreamHandler` trait shape (manual boxed futures, no
/// `async_trait`).
pub trait ConnectionHandler: Send + Sync + 'static {
    fn negotiate(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
    ) -> Pin<Box<dyn Future<Output = Result<NegotiatedSession>> + Send>>;

    /// "http" or "socks5" — C6's uniform `type()` accessor.
    fn kind(&self) -> &'static str;
}

pub struct Listener<H: ConnectionHandler> {
    bind_addr: String,
    handler: Arc<H>,
    next_id: AtomicU64,
    sessions: Arc<RwLock<HashMap<u64, SessionHandle>>>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<H: ConnectionHandler> Listener<H> {
    pub fn new(bind_addr: impl Into<String>, handler: Arc<H>) -> Arc<Self> {
        Arc::new(Self {
            bind_addr: bind_addr.into(),
            handler,
            next_id: AtomicU64::new(1),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn kind(&self) -> &'static str {
        self.handler.kind()
    }

    /// Bind and spawn the accept loop. Returns once the socket is
    /// bound, before any accept.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let tcp_listener = TokioTcpListener::bind(&self.bind_addr).await?;
        info!("[{}] listening on {}", self.kind(), self.bind_addr);

        let this = self.clone();
        tokio::spawn(async move { this.accept_loop(tcp_listener).await });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, tcp_listener: TokioTcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("[{}] accept loop stopping on {}", self.kind(), self.bind_addr);
                    break;
                }
                accepted = tcp_listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!("[{}] accept error on {}: {}", self.kind(), self.bind_addr, err);
                            continue;
                        }
                    };

                    configure_tcp_stream(&stream, &peer_addr.to_string());
                    set_keepalive(&stream, &peer_addr.to_string());

                    let conn_id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let this = self.clone();
                    tokio::spawn(async move { this.serve(stream, peer_addr, conn_id).await });
                }
            }
        }
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr, conn_id: u64) {
        match self.handler.clone().negotiate(stream, peer_addr, conn_id).await {
            Ok(negotiated) => {
                self.sessions.write().await.insert(conn_id, negotiated.handle);
                negotiated.relay.await;
                self.sessions.write().await.remove(&conn_id);
            }
            Err(ProxyError::NotTunnel) => {
                // One-shot HTTP forward already handled inline; expected, not logged.
            }
            Err(err) => {
                if err.is_loggable() {
                    info!("[{}] connection {} ({}) ended: {}", self.kind(), conn_id, peer_addr, err);
                }
            }
        }
    }

    /// Idempotent: trips the shutdown signal, stops the accept loop,
    /// closes every live session, and drains the map.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.notify_waiters();

        let mut sessions = self.sessions.write().await;
        for (_, handle) in sessions.drain() {
            (handle.close)();
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Type-erased capability set for the Server Supervisor (C6):
/// `{start, close, type, addr}`.
pub trait ManagedListener: Send + Sync {
    fn start(self: Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
    fn close(self: Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
    fn kind(&self) -> &'static str;
    fn addr(&self) -> &str;
}

impl<H: ConnectionHandler> ManagedListener for Listener<H> {
    fn start(self: Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move { Listener::start(&self).await })
    }

    fn close(self: Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move { Listener::close(&self).await })
    }

    fn kind(&self) -> &'static str {
        Listener::kind(self)
    }

    fn addr(&self) -> &str {
        Listener::addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pump::CloseGuard;
    use std::sync::atomic::AtomicU64 as AU64;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream as TokioTcpStream;

    struct EchoHandler {
        closes_seen: Arc<AU64>,
    }

    impl ConnectionHandler for EchoHandler {
        fn negotiate(
            self: Arc<Self>,
            stream: TcpStream,
            _peer_addr: SocketAddr,
            _conn_id: u64,
        ) -> Pin<Box<dyn Future<Output = Result<NegotiatedSession>> + Send>> {
            Box::pin(async move {
                let guard = CloseGuard::new();
                let closes_seen = self.closes_seen.clone();
                let guard_for_close = guard.clone();
                let handle = SessionHandle {
                    close: Arc::new(move || {
                        if guard_for_close.close_once() {
                            closes_seen.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                };
                let relay = Box::pin(async move {
                    let mut stream = stream;
                    let mut buf = [0u8; 16];
                    use tokio::io::AsyncReadExt;
                    loop {
                        tokio::select! {
                            _ = guard.wait_closed() => break,
                            n = stream.read(&mut buf) => {
                                match n {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if stream.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                });
                Ok(NegotiatedSession { handle, relay })
            })
        }

        fn kind(&self) -> &'static str {
            "echo"
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_map_drains_on_close() {
        let closes_seen = Arc::new(AU64::new(0));
        let handler = Arc::new(EchoHandler { closes_seen });
        let listener = Listener::new("127.0.0.1:0", handler);

        // bind manually to get a real ephemeral port for the test
        let tcp = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener_for_loop = listener.clone();
        tokio::spawn(async move { listener_for_loop.accept_loop(tcp).await });

        let _c1 = TokioTcpStream::connect(addr).await.unwrap();
        let _c2 = TokioTcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(listener.session_count().await, 2);
        listener.close().await.unwrap();
        assert_eq!(listener.session_count().await, 0);

        // idempotent
        listener.close().await.unwrap();
    }
}
