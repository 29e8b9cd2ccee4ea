//! HTTP Proxy Session (C3): `New → Parse → {Tunnel | Forward} →
//! Relaying | Terminal`.

use crate::core::listener::{ConnectionHandler, NegotiatedSession, SessionHandle};
use crate::core::pump::{self, CloseGuard};
use crate::error::{ProxyError, Result};
use crate::util::dns::resolve_host;
use crate::util::net::{configure_tcp_stream, set_keepalive};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tracing::{debug, info};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADER_SIZE: usize = 64 * 1024;
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// Bounds each read of the forward-request response; an upstream that
/// keeps the connection open past its last byte (ordinary HTTP/1.1
/// behavior, since no `Connection: close` is sent) would otherwise
/// hang this loop, and the session task, forever.
const FORWARD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default port for a `CONNECT` target that carries no explicit port.
/// Deliberately 80, not the common 443-for-HTTPS-tunnel convention.
const DEFAULT_CONNECT_PORT: u16 = 80;

struct ParsedRequest {
    method: String,
    version: String,
    target_host: String,
    target_port: u16,
    path: String,
    is_connect: bool,
    headers: Vec<String>,
    body: Vec<u8>,
}

impl ParsedRequest {
    fn keep_alive_requested(&self) -> bool {
        find_header(&self.headers, "Proxy-Connection")
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false)
    }
}

pub struct HttpHandler;

impl HttpHandler {
    pub fn new() -> Self {
        Self
    }

    async fn run(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
    ) -> Result<NegotiatedSession> {
        let request = match timeout(HEADER_READ_TIMEOUT, read_request(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProxyError::Protocol("timed out reading HTTP request header".into()));
            }
        };

        if request.is_connect {
            self.tunnel(stream, peer_addr, conn_id, request).await
        } else {
            self.forward(&mut stream, peer_addr, conn_id, request).await?;
            Err(ProxyError::NotTunnel)
        }
    }

    async fn tunnel(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
        request: ParsedRequest,
    ) -> Result<NegotiatedSession> {
        let outbound = match self.dial(&mut stream, &request).await {
            Ok(conn) => conn,
            Err(err) => return Err(err),
        };

        configure_tcp_stream(&outbound, &format!("{}:{}", request.target_host, request.target_port));

        let established = format!(
            "{} 200 Connection Established\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
            request.version
        );
        stream.write_all(established.as_bytes()).await?;

        if request.keep_alive_requested() {
            set_keepalive(&stream, &peer_addr.to_string());
            set_keepalive(&outbound, &format!("{}:{}", request.target_host, request.target_port));
        }

        info!(
            "[http:{conn_id}] {peer_addr} CONNECT {}:{}",
            request.target_host, request.target_port
        );

        let client = Arc::new(stream);
        let outbound = Arc::new(outbound);
        let guard = CloseGuard::new();

        let handle = {
            let guard = guard.clone();
            SessionHandle {
                close: Arc::new(move || {
                    guard.close_once();
                }),
            }
        };

        let relay: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            let (a_bytes, b_bytes) = pump::run(client, outbound, guard).await;
            debug!("[http:{conn_id}] tunnel closed ({a_bytes} / {b_bytes} bytes)");
        });

        Ok(NegotiatedSession { handle, relay })
    }

    async fn forward(
        &self,
        client: &mut TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
        request: ParsedRequest,
    ) -> Result<()> {
        let mut outbound = self.dial(client, &request).await?;

        info!(
            "[http:{conn_id}] {peer_addr} {} {}{}",
            request.method, request.target_host, request.path
        );

        let outgoing = build_forward_request(&request, &peer_addr);
        outbound.write_all(&outgoing).await?;
        if !request.body.is_empty() {
            outbound.write_all(&request.body).await?;
        }

        let mut buf = vec![0u8; 8192];
        loop {
            let n = timeout(FORWARD_READ_TIMEOUT, outbound.read(&mut buf))
                .await
                .map_err(|_| ProxyError::Protocol("forward response read timed out".into()))??;
            if n == 0 {
                break;
            }
            client.write_all(&buf[..n]).await?;
        }

        Ok(())
    }

    /// Resolve and dial the request's target, writing an error status
    /// line back to `client` and returning `Err` on any failure.
    async fn dial(&self, client: &mut TcpStream, request: &ParsedRequest) -> Result<TcpStream> {
        let target = match resolve_host(&request.target_host, request.target_port).await {
            Ok(target) => target,
            Err(err) => {
                write_status_line(client, &request.version, 502, "Bad Gateway").await?;
                return Err(err);
            }
        };

        match timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => {
                write_status_line(client, &request.version, 502, "Bad Gateway").await?;
                Err(ProxyError::Dial(err))
            }
            Err(_) => {
                write_status_line(client, &request.version, 504, "Gateway Timeout").await?;
                Err(ProxyError::Dial(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {}:{} timed out", request.target_host, request.target_port),
                )))
            }
        }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHandler for HttpHandler {
    fn negotiate(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        conn_id: u64,
    ) -> Pin<Box<dyn Future<Output = Result<NegotiatedSession>> + Send>> {
        Box::pin(async move { self.run(stream, peer_addr, conn_id).await })
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<ParsedRequest> {
    let mut buf = Vec::with_capacity(1024);
    let mut tmp = [0u8; 1024];

    let header_end = loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(ProxyError::Protocol("connection closed before HTTP header complete".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > MAX_HEADER_SIZE {
            return Err(ProxyError::Protocol("HTTP header too large".into()));
        }
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
    };

    let header_bytes = buf[..header_end].to_vec();
    let body = buf[header_end..].to_vec();
    let header_str = String::from_utf8(header_bytes)
        .map_err(|err| ProxyError::Protocol(format!("invalid HTTP header encoding: {err}")))?;

    parse_request(&header_str, body)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

fn parse_request(header: &str, body: Vec<u8>) -> Result<ParsedRequest> {
    let mut lines = header.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::Protocol("missing HTTP request line".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::Protocol("invalid HTTP request line".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::Protocol("invalid HTTP request line".into()))?;
    let version = parts.next().unwrap_or("HTTP/1.1");

    let headers: Vec<String> = lines.map(str::to_string).filter(|l| !l.is_empty()).collect();

    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let (target_host, target_port, path) = determine_target(method, target, &headers, is_connect)?;

    Ok(ParsedRequest {
        method: method.to_string(),
        version: version.to_string(),
        target_host,
        target_port,
        path,
        is_connect,
        headers,
        body,
    })
}

fn determine_target(
    method: &str,
    target: &str,
    headers: &[String],
    is_connect: bool,
) -> Result<(String, u16, String)> {
    if is_connect {
        let (host, port) = split_host_port(target, DEFAULT_CONNECT_PORT);
        return Ok((host, port, String::new()));
    }

    let mut host = String::new();
    let mut port = 80u16;
    let mut path = target.to_string();

    if let Some(rest) = target.strip_prefix("http://") {
        (host, path) = split_authority_and_path(rest);
    } else if let Some(rest) = target.strip_prefix("https://") {
        port = 443;
        (host, path) = split_authority_and_path(rest);
    } else if let Some(value) = find_header(headers, "Host") {
        host = value.to_string();
    }

    if host.is_empty() {
        return Err(ProxyError::Protocol(format!("{method} request carries no Host")));
    }

    let (host, port) = split_host_port(&host, port);
    if !path.starts_with('/') && !path.starts_with('*') {
        path = format!("/{path}");
    }

    Ok((host, port, path))
}

fn split_authority_and_path(rest: &str) -> (String, String) {
    match rest.find('/') {
        Some(pos) => (rest[..pos].to_string(), rest[pos..].to_string()),
        None => (rest.to_string(), "/".to_string()),
    }
}

fn find_header<'a>(headers: &'a [String], name: &str) -> Option<&'a str> {
    headers.iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn split_host_port(value: &str, default_port: u16) -> (String, u16) {
    let trimmed = value.trim();

    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let tail = &rest[end + 1..];
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }

    if let Some(idx) = trimmed.rfind(':') {
        if !trimmed[..idx].contains(':') {
            if let Ok(port) = trimmed[idx + 1..].parse() {
                return (trimmed[..idx].to_string(), port);
            }
        }
    }

    (trimmed.to_string(), default_port)
}

/// Rebuild the request for the upstream leg: same method/path/version,
/// headers copied verbatim except `Host` (rewritten to the resolved
/// target) and `X-Forwarded-For` (comma-appended with the client's IP).
fn build_forward_request(request: &ParsedRequest, peer_addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::new();
    let path = if request.path.is_empty() { "/" } else { &request.path };
    out.extend_from_slice(format!("{} {} {}\r\n", request.method, path, request.version).as_bytes());

    let host_value = if request.target_port == 80 || request.target_port == 443 {
        request.target_host.clone()
    } else {
        format!("{}:{}", request.target_host, request.target_port)
    };

    let forwarded_for = match find_header(&request.headers, "X-Forwarded-For") {
        Some(existing) => format!("{existing}, {}", peer_addr.ip()),
        None => peer_addr.ip().to_string(),
    };

    let mut host_written = false;
    let mut forwarded_written = false;
    for line in &request.headers {
        let Some((key, _)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("Host") {
            out.extend_from_slice(format!("Host: {host_value}\r\n").as_bytes());
            host_written = true;
        } else if key.trim().eq_ignore_ascii_case("X-Forwarded-For") {
            out.extend_from_slice(format!("X-Forwarded-For: {forwarded_for}\r\n").as_bytes());
            forwarded_written = true;
        } else {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    if !host_written {
        out.extend_from_slice(format!("Host: {host_value}\r\n").as_bytes());
    }
    if !forwarded_written {
        out.extend_from_slice(format!("X-Forwarded-For: {forwarded_for}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

async fn write_status_line(stream: &mut TcpStream, version: &str, code: u16, reason: &str) -> Result<()> {
    let body = format!("{version} {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(body.as_bytes()).await?;
    Ok(())
}
