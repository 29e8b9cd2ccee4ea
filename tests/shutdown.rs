//! Graceful shutdown mid-relay (spec scenario 6): an active tunnel
//! transferring a sizeable payload is torn down cleanly by `close_all`,
//! within a bounded grace period, and the listener's session map ends
//! up empty.

mod common;

use common::reserve_loopback_addr;
use forward_proxy::core::{Listener, Supervisor};
use forward_proxy::http::HttpHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const PAYLOAD_SIZE: usize = 1024 * 1024;

#[tokio::test]
async fn shutdown_mid_relay_closes_both_ends_within_grace_period() {
    let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = dest.local_addr().unwrap();
    let sink = tokio::spawn(async move {
        let (mut s, _) = dest.accept().await.unwrap();
        let mut received = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match s.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received += n,
            }
        }
        received
    });

    let proxy_addr = reserve_loopback_addr();
    let supervisor = Arc::new(Supervisor::new());
    let listener = Listener::new(proxy_addr.clone(), Arc::new(HttpHandler::new()));
    supervisor.add(listener).await.unwrap();

    let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
    let request = format!("CONNECT {dest_addr} HTTP/1.1\r\nHost: {dest_addr}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut tmp = [0u8; 256];
    loop {
        let n = client.read(&mut tmp).await.unwrap();
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let payload = vec![0x42u8; PAYLOAD_SIZE];
    client.write_all(&payload).await.unwrap();

    let supervisor_for_shutdown = supervisor.clone();
    let shutdown = tokio::spawn(async move { supervisor_for_shutdown.close_all().await });

    let failures = timeout(Duration::from_secs(3), shutdown)
        .await
        .expect("close_all completed within the grace period")
        .unwrap();
    assert!(failures.is_empty());

    let mut probe = [0u8; 1];
    let client_eof = timeout(Duration::from_secs(3), client.read(&mut probe))
        .await
        .expect("client side observed closure within the grace period")
        .unwrap();
    assert_eq!(client_eof, 0);

    let received = timeout(Duration::from_secs(3), sink).await.unwrap().unwrap();
    assert_eq!(received, PAYLOAD_SIZE);

    assert!(supervisor.is_empty().await);
}
