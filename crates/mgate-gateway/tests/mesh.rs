//! Mesh HTTP surface over plaintext h2c: token auth, proxying, debug dumps.

use bytes::Bytes;
use h2::client::SendRequest;
use mgate_gateway::config::{GatewayConfig, ListenerConfig, Protocol};
use mgate_gateway::mux::H2Stream;
use mgate_gateway::router::Gateway;
use mgate_gateway::tls::NodeIdentity;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn h2c_gateway(secret: Vec<u8>) -> (Arc<Gateway>, SendRequest<Bytes>) {
    let config = GatewayConfig {
        cert_path: PathBuf::new(),
        key_path: PathBuf::new(),
        secret: Some(secret),
        listeners: Vec::new(),
        h2r: Vec::new(),
    };
    let gateway = Arc::new(Gateway::new(config, NodeIdentity::generate().unwrap()));
    let addr = gateway
        .listeners
        .add(
            &gateway,
            ListenerConfig {
                address: "127.0.0.1:0".into(),
                protocol: Protocol::Http,
                forward_to: None,
                alpn: Vec::new(),
                handler: None,
            },
        )
        .await
        .unwrap()
        .unwrap();

    // the client preface classifies the connection as h2c
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (send, connection) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    (gateway, send.ready().await.unwrap())
}

async fn body_bytes(resp: http::Response<h2::RecvStream>) -> Vec<u8> {
    let mut body = resp.into_body();
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn identity_echo_needs_no_auth() {
    let secret = mgate_core::generate_secret();
    let (gateway, mut send) = h2c_gateway(secret).await;

    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri("http://mesh.internal/dm/id")
        .body(())
        .unwrap();
    let (resp, _) = send.send_request(req, true).unwrap();
    let resp = resp.await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = body_bytes(resp).await;
    assert_eq!(body, gateway.identity.identity.as_bytes());
}

#[tokio::test]
async fn proxy_without_auth_is_refused() {
    let secret = mgate_core::generate_secret();
    let (_gateway, mut send) = h2c_gateway(secret).await;

    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri("http://mesh.internal/dm/127.0.0.1:9999")
        .body(())
        .unwrap();
    let (resp, _) = send.send_request(req, false).unwrap();
    let resp = resp.await.unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn bearer_token_authorizes_proxy() {
    // plain upstream echo
    let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let (mut r, mut w) = conn.split();
        tokio::io::copy(&mut r, &mut w).await.unwrap();
        w.shutdown().await.unwrap();
    });

    let secret = mgate_core::generate_secret();
    let token = mgate_core::create_token(&secret, "peer-a", 60);
    let (_gateway, mut send) = h2c_gateway(secret).await;

    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri(format!("http://mesh.internal/dm/{upstream_addr}"))
        .header("authorization", format!("Bearer {token}"))
        .body(())
        .unwrap();
    let (resp, send_stream) = send.send_request(req, false).unwrap();
    let resp = resp.await.unwrap();
    assert_eq!(resp.status(), 200);

    let mut stream = H2Stream::new(send_stream, resp.into_body());
    stream.write_all(b"Hello world").await.unwrap();
    let mut buf = [0u8; 11];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"Hello world");
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn tampered_token_is_refused() {
    let secret = mgate_core::generate_secret();
    let token = mgate_core::create_token(&secret, "peer-a", 60);
    let (_gateway, mut send) = h2c_gateway(secret).await;

    let mut raw = hex::decode(&token).unwrap();
    raw[9] ^= 0xff;
    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri("http://mesh.internal/dm/127.0.0.1:9999")
        .header("authorization", format!("Bearer {}", hex::encode(raw)))
        .body(())
        .unwrap();
    let (resp, _) = send.send_request(req, false).unwrap();
    let resp = resp.await.unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn debug_dumps_are_json() {
    let secret = mgate_core::generate_secret();
    let (_gateway, mut send) = h2c_gateway(secret).await;

    for path in ["/dm/streams", "/dm/nodes"] {
        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri(format!("http://mesh.internal{path}"))
            .body(())
            .unwrap();
        let (resp, _) = send.send_request(req, true).unwrap();
        let resp = resp.await.unwrap();
        assert_eq!(resp.status(), 200);
        let body = body_bytes(resp).await;
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(v.is_array());
    }
}
