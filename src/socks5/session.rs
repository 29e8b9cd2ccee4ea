//! SOCKS5 Proxy Session (C4): `New → Handshake → [Auth] → Command →
//! {Dial | UdpAssociate} → Relaying | Terminal`.

use crate::core::listener::{ConnectionHandler, NegotiatedSession, SessionHandle};
use crate::core::pump::{self, CloseGuard};
use crate::error::{ProxyError, Result};
use crate::socks5::frame::{self, Address, Command, ReplyCode};
use crate::util::dns::resolve_host;
use crate::util::net::configure_tcp_stream;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Duration, timeout};
use tracing::{debug, info};

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

fn unbound_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
}

/// Narrow capability plugged into the Session: given `(user, pass)`,
/// decide whether to accept. Static credentials from the config file
/// are the default implementation.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, user: &str, pass: &str) -> bool;
}

pub struct StaticAuthenticator {
    user: String,
    pass: String,
}

impl StaticAuthenticator {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self { user: user.into(), pass: pass.into() }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, user: &str, pass: &str) -> bool {
        user == self.user && pass == self.pass
    }
}

pub struct Socks5Handler {
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Socks5Handler {
    pub fn new(authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        Self { authenticator }
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        let offered = frame::read_handshake(stream).await?;

        let selected = if self.authenticator.is_some() && offered.contains(&frame::METHOD_USERPASS) {
            Some(frame::METHOD_USERPASS)
        } else if self.authenticator.is_none() && offered.contains(&frame::METHOD_NONE) {
            Some(frame::METHOD_NONE)
        } else {
            None
        };

        // Explicit "no acceptable method" branch rather than a
        // zero-initialized default.
        let method = selected.unwrap_or(frame::METHOD_NO_ACCEPTABLE);
        frame::write_handshake_reply(stream, method).await?;

        if selected.is_none() {
            return Err(ProxyError::Unsupported("no acceptable SOCKS5 auth method offered".into()));
        }

        if method == frame::METHOD_USERPASS {
            self.authenticate(stream).await?;
        }

        Ok(())
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        let (user, pass) = frame::read_auth_request(stream).await?;
        let authenticator = self
            .authenticator
            .as_ref()
            .expect("authenticate only called when authenticator is configured");
        let ok = authenticator.authenticate(&user, &pass);
        frame::write_auth_reply(stream, ok).await?;
        if !ok {
            return Err(ProxyError::AuthFailed);
        }
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
    ) -> Result<NegotiatedSession> {
        self.handshake(&mut stream).await?;

        let (cmd, addr, port) = frame::read_command(&mut stream).await?;

        match cmd {
            Command::Bind => {
                frame::write_command_reply(&mut stream, ReplyCode::CommandNotSupported, unbound_addr()).await?;
                Err(ProxyError::Unsupported("BIND is not supported".into()))
            }
            Command::Connect => self.connect(stream, peer_addr, conn_id, addr, port).await,
            Command::Udp => self.udp_associate(stream, peer_addr, conn_id).await,
        }
    }

    async fn connect(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
        addr: Address,
        port: u16,
    ) -> Result<NegotiatedSession> {
        let host = addr.to_host_string();
        let target = resolve_host(&host, port).await.map_err(|err| {
            debug!("[socks5:{conn_id}] resolve {host}:{port} failed: {err}");
            err
        })?;

        let outbound = match timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                let rep = ReplyCode::from_dial_error(&err);
                frame::write_command_reply(&mut stream, rep, unbound_addr()).await?;
                return Err(ProxyError::Dial(err));
            }
            Err(_) => {
                frame::write_command_reply(&mut stream, ReplyCode::TtlExpired, unbound_addr()).await?;
                return Err(ProxyError::Dial(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                )));
            }
        };

        configure_tcp_stream(&outbound, &format!("{host}:{port}"));
        let bound = outbound.local_addr().unwrap_or(unbound_addr());
        frame::write_command_reply(&mut stream, ReplyCode::Succeeded, bound).await?;

        info!("[socks5:{conn_id}] {peer_addr} CONNECT {host}:{port}");

        let client = Arc::new(stream);
        let outbound = Arc::new(outbound);
        let guard = CloseGuard::new();

        let handle = close_handle(guard.clone());
        let relay: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            let (a_bytes, b_bytes) = pump::run(client, outbound, guard).await;
            debug!("[socks5:{conn_id}] closed ({a_bytes} / {b_bytes} bytes)");
        });

        Ok(NegotiatedSession { handle, relay })
    }

    async fn udp_associate(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
    ) -> Result<NegotiatedSession> {
        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        let bound = udp.local_addr().unwrap_or(unbound_addr());
        frame::write_command_reply(&mut stream, ReplyCode::Succeeded, bound).await?;

        info!("[socks5:{conn_id}] {peer_addr} UDP ASSOCIATE, bound {bound}");

        let control = Arc::new(stream);
        let udp = Arc::new(udp);
        let guard = CloseGuard::new();

        let handle = close_handle(guard.clone());
        let relay: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(run_udp_associate(control, udp, guard));

        Ok(NegotiatedSession { handle, relay })
    }
}

impl ConnectionHandler for Socks5Handler {
    fn negotiate(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
    ) -> Pin<Box<dyn Future<Output = Result<NegotiatedSession>> + Send>> {
        Box::pin(async move { self.run(stream, peer_addr, conn_id).await })
    }

    fn kind(&self) -> &'static str {
        "socks5"
    }
}

fn close_handle(guard: Arc<CloseGuard>) -> SessionHandle {
    SessionHandle {
        close: Arc::new(move || {
            guard.close_once();
        }),
    }
}

/// UDP ASSOCIATE relay: both directions read/write the SOCKS5 UDP
/// wrapper on the client's original TCP control connection (see
/// DESIGN.md decision #4), forwarding payloads to/from one real UDP
/// socket facing the destination.
async fn run_udp_associate(control: Arc<TcpStream>, udp: Arc<UdpSocket>, guard: Arc<CloseGuard>) {
    let t1 = tokio::spawn(udp_client_to_dest(control.clone(), udp.clone(), guard.clone()));
    let t2 = tokio::spawn(udp_dest_to_client(control.clone(), udp.clone(), guard.clone()));
    let _ = tokio::join!(t1, t2);

    if guard.close_once() {
        crate::util::net::force_close(&control);
    }
}

async fn udp_client_to_dest(control: Arc<TcpStream>, udp: Arc<UdpSocket>, guard: Arc<CloseGuard>) {
    loop {
        let decoded = tokio::select! {
            _ = guard.wait_closed() => break,
            res = async {
                let mut reader = &*control;
                frame::read_udp_datagram(&mut reader).await
            } => res,
        };

        let (addr, port, data) = match decoded {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("[socks5-udp] read from control channel failed: {err}");
                break;
            }
        };

        let host = addr.to_host_string();
        let target = match resolve_host(&host, port).await {
            Ok(target) => target,
            Err(err) => {
                debug!("[socks5-udp] resolve {host}:{port} failed: {err}");
                continue;
            }
        };

        if let Err(err) = udp.send_to(&data, target).await {
            debug!("[socks5-udp] send to {target} failed: {err}");
            break;
        }
    }
}

async fn udp_dest_to_client(control: Arc<TcpStream>, udp: Arc<UdpSocket>, guard: Arc<CloseGuard>) {
    let mut buf = vec![0u8; 65_507];
    loop {
        let received = tokio::select! {
            _ = guard.wait_closed() => break,
            res = udp.recv_from(&mut buf) => res,
        };

        let (n, from) = match received {
            Ok(pair) => pair,
            Err(err) => {
                debug!("[socks5-udp] recv failed: {err}");
                break;
            }
        };

        let addr = match from.ip() {
            IpAddr::V4(ip) => Address::V4(ip),
            IpAddr::V6(ip) => Address::V6(ip),
        };
        let encoded = frame::encode_udp_datagram(&addr, from.port(), &buf[..n]);

        let mut writer = &*control;
        if let Err(err) = writer.write_all(&encoded).await {
            debug!("[socks5-udp] write to control channel failed: {err}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn no_auth_connect_to_ipv4_echo_server() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 3];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let (server_side, mut client_side) = connected_pair().await;
        let handler = Arc::new(Socks5Handler::new(None));

        let server_task = tokio::spawn(async move {
            handler.run(server_side, "127.0.0.1:0".parse().unwrap(), 1).await
        });

        client_side.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut cmd = vec![0x05, 0x01, 0x00, 0x01];
        cmd.extend_from_slice(&echo_addr.ip().to_string().parse::<std::net::Ipv4Addr>().unwrap().octets());
        cmd.extend_from_slice(&echo_addr.port().to_be_bytes());
        client_side.write_all(&cmd).await.unwrap();

        let mut cmd_reply = [0u8; 10];
        client_side.read_exact(&mut cmd_reply).await.unwrap();
        assert_eq!(cmd_reply[0], 0x05);
        assert_eq!(cmd_reply[1], 0x00);

        client_side.write_all(b"ABC").await.unwrap();
        let mut echoed = [0u8; 3];
        client_side.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ABC");

        drop(client_side);
        let negotiated = server_task.await.unwrap().unwrap();
        negotiated.relay.await;
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_without_dialing() {
        let (server_side, mut client_side) = connected_pair().await;
        let auth = Arc::new(StaticAuthenticator::new("user", "right"));
        let handler = Arc::new(Socks5Handler::new(Some(auth)));

        let server_task = tokio::spawn(async move {
            handler.run(server_side, "127.0.0.1:0".parse().unwrap(), 1).await
        });

        client_side.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02]);

        let mut auth_req = vec![0x05, 4];
        auth_req.extend_from_slice(b"user");
        auth_req.push(5);
        auth_req.extend_from_slice(b"wrong");
        client_side.write_all(&auth_req).await.unwrap();

        let mut auth_reply = [0u8; 2];
        client_side.read_exact(&mut auth_reply).await.unwrap();
        assert_eq!(auth_reply, [0x05, 0x01]);

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::AuthFailed)));
    }

    #[tokio::test]
    async fn bind_command_is_rejected() {
        let (server_side, mut client_side) = connected_pair().await;
        let handler = Arc::new(Socks5Handler::new(None));

        let server_task = tokio::spawn(async move {
            handler.run(server_side, "127.0.0.1:0".parse().unwrap(), 1).await
        });

        client_side.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client_side.read_exact(&mut reply).await.unwrap();

        let mut cmd = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1];
        cmd.extend_from_slice(&1234u16.to_be_bytes());
        client_side.write_all(&cmd).await.unwrap();

        let mut cmd_reply = [0u8; 10];
        client_side.read_exact(&mut cmd_reply).await.unwrap();
        assert_eq!(cmd_reply[1], 0x07);

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Unsupported(_))));
    }

    #[tokio::test]
    async fn handshake_with_no_methods_replies_no_acceptable() {
        let (server_side, mut client_side) = connected_pair().await;
        let handler = Arc::new(Socks5Handler::new(None));

        let server_task = tokio::spawn(async move {
            handler.run(server_side, "127.0.0.1:0".parse().unwrap(), 1).await
        });

        client_side.write_all(&[0x05, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xff]);

        let result = server_task.await.unwrap();
        assert!(result.is_err());
    }
}
