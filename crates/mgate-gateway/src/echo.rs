//! Echo handler.
//!
//! Writes one JSON metadata line (stream id, destination, TLS state) followed
//! by `\n`, then mirrors every received byte until EOF and closes its write
//! side. Registered under the name `echo`; tests and demos point listeners at
//! it to observe exactly what a stream looks like after sniffing, TLS
//! termination, and routing.

use crate::router::Handler;
use mgate_core::{GateError, GateResult, Stream};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct EchoHandler;

impl Handler for EchoHandler {
    fn handle<'a>(
        &'a self,
        stream: &'a mut Stream,
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let snap = stream.info.snapshot();
            let meta = serde_json::json!({
                "stream_id": snap.stream_id,
                "dest": snap.dest,
                "tls": snap.tls,
            });
            let mut line = serde_json::to_vec(&meta)
                .map_err(|e| GateError::Other(format!("echo metadata: {e}")))?;
            line.push(b'\n');
            stream.io.write_all(&line).await?;

            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = stream.io.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stream.info.note_read(n);
                stream.io.write_all(&buf[..n]).await?;
                stream.info.note_write(n);
            }
            stream.io.shutdown().await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metadata_line_then_echo_then_eof() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut stream = Stream::new("test", Box::new(server));
        stream.info.set_dest("example.com:80");
        let info = stream.info.clone();

        let handler = EchoHandler;
        let task = tokio::spawn(async move { handler.handle(&mut stream).await });

        let mut meta = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            client.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            meta.push(byte[0]);
        }
        let v: serde_json::Value = serde_json::from_slice(&meta).unwrap();
        assert_eq!(v["dest"], "example.com:80");
        assert_eq!(v["stream_id"], info.stream_id);

        client.write_all(b"Hello world").await.unwrap();
        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello world");

        client.write_all(b"chunk2").await.unwrap();
        let mut buf2 = [0u8; 6];
        client.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"chunk2");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        task.await.unwrap().unwrap();
        assert_eq!(info.snapshot().rcvd_bytes, 17);
        assert_eq!(info.snapshot().sent_bytes, 17);
    }
}
