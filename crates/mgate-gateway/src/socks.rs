//! SOCKS5 egress capture.
//!
//! Speaks just enough of RFC 1928 to capture outbound traffic: no-auth
//! negotiation (the port binds on loopback, or the connection arrived over
//! mutual TLS), CONNECT command only, all three address types. The parsed
//! destination lands on the stream and the connection is routed like any
//! other egress — which means a destination that names a mesh identity goes
//! through the mesh, not a plain dial.
//!
//! curl --socks5 127.0.0.1:15008 ...

use crate::router::{run_handler, splice, Gateway, Upstream};
use mgate_core::{BoxConn, GateError, GateResult, Stream, StreamInfo};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const SOCKS_VERSION: u8 = 5;

const CMD_CONNECT: u8 = 1;

const ATYP_IPV4: u8 = 1;
const ATYP_FQDN: u8 = 3;
const ATYP_IPV6: u8 = 4;

const REPLY_SUCCESS: u8 = 0;
const REPLY_FAILURE: u8 = 1;
const REPLY_CMD_NOT_SUPPORTED: u8 = 7;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 8;

/// Negotiate, parse the request, dial through the router, splice.
pub async fn handle(
    gateway: &Arc<Gateway>,
    mut io: BoxConn,
    info: &Arc<StreamInfo>,
) -> GateResult<()> {
    // Greeting: VER NMETHODS METHOD... The fixed no-auth reply goes out
    // before the request is read.
    let mut head = [0u8; 2];
    io.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(GateError::Sniff(format!(
            "SOCKS version {} not supported",
            head[0]
        )));
    }
    let mut methods = vec![0u8; head[1] as usize];
    io.read_exact(&mut methods).await?;
    io.write_all(&[SOCKS_VERSION, 0]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut req = [0u8; 4];
    io.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(GateError::Sniff(format!("bad request version {}", req[0])));
    }
    if req[1] != CMD_CONNECT {
        reply(&mut io, REPLY_CMD_NOT_SUPPORTED).await?;
        return Err(GateError::Sniff(format!(
            "SOCKS command {} not supported",
            req[1]
        )));
    }

    let dest = match req[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 6];
            io.read_exact(&mut addr).await?;
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            let port = u16::from_be_bytes([addr[4], addr[5]]);
            info.set_stream_type("socks5ip");
            format!("{ip}:{port}")
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 18];
            io.read_exact(&mut addr).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([addr[16], addr[17]]);
            info.set_stream_type("socks5ip");
            format!("[{ip}]:{port}")
        }
        ATYP_FQDN => {
            let mut len = [0u8; 1];
            io.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(GateError::Sniff("empty SOCKS hostname".into()));
            }
            let mut name = vec![0u8; len[0] as usize];
            io.read_exact(&mut name).await?;
            let mut port_buf = [0u8; 2];
            io.read_exact(&mut port_buf).await?;
            let host = String::from_utf8(name)
                .map_err(|_| GateError::Sniff("SOCKS hostname not utf-8".into()))?;
            let port = u16::from_be_bytes(port_buf);
            format!("{host}:{port}")
        }
        other => {
            reply(&mut io, REPLY_ATYP_NOT_SUPPORTED).await?;
            return Err(GateError::Sniff(format!(
                "SOCKS address type {other} not supported"
            )));
        }
    };
    info.set_dest(&dest);
    debug!(stream_id = info.stream_id, dest = %dest, "socks5 request");

    let upstream = match gateway.connect(&dest, info.peer_identity().as_deref()).await {
        Ok(up) => up,
        Err(e) => {
            reply(&mut io, REPLY_FAILURE).await?;
            return Err(e);
        }
    };
    reply(&mut io, REPLY_SUCCESS).await?;

    match upstream {
        Upstream::Handler(handler) => {
            let mut stream = Stream {
                info: info.clone(),
                io,
            };
            run_handler(&handler, &mut stream).await
        }
        Upstream::Io(up) => splice(io, up, info).await,
    }
}

/// Reply with `code` and a zeroed IPv4 bound address.
async fn reply(io: &mut BoxConn, code: u8) -> GateResult<()> {
    io.write_all(&[SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}
