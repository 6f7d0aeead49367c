//! Echo round-trip through a bound listener.

use mgate_gateway::config::{GatewayConfig, ListenerConfig, Protocol};
use mgate_gateway::echo::EchoHandler;
use mgate_gateway::router::Gateway;
use mgate_gateway::tls::NodeIdentity;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn test_gateway() -> Arc<Gateway> {
    let config = GatewayConfig {
        cert_path: PathBuf::new(),
        key_path: PathBuf::new(),
        secret: None,
        listeners: Vec::new(),
        h2r: Vec::new(),
    };
    let gateway = Arc::new(Gateway::new(config, NodeIdentity::generate().unwrap()));
    gateway.register_handler("echo", Arc::new(EchoHandler));
    gateway
}

#[tokio::test]
async fn echo_round_trip() {
    let gateway = test_gateway();
    let addr = gateway
        .listeners
        .add(
            &gateway,
            ListenerConfig {
                address: ":0".into(),
                protocol: Protocol::Tcp,
                forward_to: None,
                alpn: Vec::new(),
                handler: Some("echo".into()),
            },
        )
        .await
        .unwrap()
        .expect("bound listener has an address");

    let conn = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write) = conn.into_split();
    let mut read = BufReader::new(read_half);

    // metadata line first
    let mut meta = String::new();
    read.read_line(&mut meta).await.unwrap();
    let v: serde_json::Value = serde_json::from_str(&meta).unwrap();
    assert!(v["stream_id"].is_u64());

    write.write_all(b"Hello world").await.unwrap();
    let mut buf = [0u8; 11];
    read.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"Hello world");

    write.write_all(b"chunk2").await.unwrap();
    let mut buf2 = [0u8; 6];
    read.read_exact(&mut buf2).await.unwrap();
    assert_eq!(&buf2, b"chunk2");

    // half-close: next read is EOF
    write.shutdown().await.unwrap();
    let mut rest = Vec::new();
    read.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    // terminal accounting unregisters the stream
    for _ in 0..100 {
        if gateway.streams.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gateway.streams.is_empty());
    assert_eq!(
        gateway
            .streams
            .total_accepted
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn tcp_forward_to_upstream() {
    // a plain upstream echo server, no metadata line
    let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let (mut r, mut w) = conn.split();
        tokio::io::copy(&mut r, &mut w).await.unwrap();
        w.shutdown().await.unwrap();
    });

    let gateway = test_gateway();
    let addr = gateway
        .listeners
        .add(
            &gateway,
            ListenerConfig {
                address: ":0".into(),
                protocol: Protocol::Tcp,
                forward_to: Some(upstream_addr.to_string()),
                alpn: Vec::new(),
                handler: None,
            },
        )
        .await
        .unwrap()
        .unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"through the gateway").await.unwrap();
    let mut buf = [0u8; 19];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the gateway");
}
