//! Reverse tunnels — the HTTP equivalent of `ssh -R`.
//!
//! A node behind NAT dials a routable gateway with ALPN `h2r, h2` and keeps
//! the connection as a role-inverted HTTP/2 session: when `h2r` is
//! negotiated the dialing side becomes the H2 *server*, and the gateway
//! opens an H2 client over the accepted connection, issuing proxy requests
//! back through the tunnel. When only `h2` is available the reverse channel
//! is carried inside a `POST /h2r/` request body instead.
//!
//! Each pinned peer runs an explicit state machine (Disconnected →
//! Connecting → Connected → Backoff) in its own task; exactly one attempt is
//! in flight per peer, and a new one is only scheduled from the failure
//! path.

use crate::config::PinnedPeer;
use crate::mux::{connect_muxer, ID_PATH};
use crate::proxy::serve_session;
use crate::router::Gateway;
use crate::tls::tls_connect;
use mgate_core::{short_id, BoxConn, GateError, GateResult, StreamInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Tunnel lifecycle for one pinned peer. The client-vs-server role comes
/// out of the Connecting transition as the [`Session`] variant.
enum TunnelState {
    Disconnected,
    Connecting,
    Connected(Session),
    Backoff(Duration),
}

/// An established tunnel and the role ALPN negotiation assigned us.
enum Session {
    /// ALPN `h2r`: we dialed, we serve.
    Reverse { io: BoxConn, peer_id: String },
    /// ALPN `h2` fallback: serve over the synthetic duplex inside
    /// `POST /h2r/`; the outer client session doubles as a forward muxer
    /// to the gateway, registered under `mux_epoch`.
    Fallback {
        duplex: crate::mux::H2Stream,
        peer_id: String,
        mux_epoch: u64,
    },
}

impl Session {
    fn peer_id(&self) -> &str {
        match self {
            Session::Reverse { peer_id, .. } => peer_id,
            Session::Fallback { peer_id, .. } => peer_id,
        }
    }

    /// Serve the reversed session until it ends.
    async fn serve(self, gateway: &Arc<Gateway>) -> GateResult<()> {
        match self {
            Session::Reverse { io, peer_id } => {
                serve_session(gateway.clone(), io, Some(peer_id)).await
            }
            Session::Fallback {
                duplex,
                peer_id,
                mux_epoch,
            } => {
                let res = serve_session(gateway.clone(), duplex, Some(peer_id.clone())).await;
                // the forward muxer rode on the same connection
                if let Some(node) = gateway.nodes.get(&peer_id) {
                    node.clear_muxer(mux_epoch);
                }
                res
            }
        }
    }
}

/// Spawn one keeper task per configured pinned peer.
pub fn maintain_pinned_peers(gateway: Arc<Gateway>) {
    for peer in gateway.config.h2r.clone() {
        let gw = gateway.clone();
        tokio::spawn(async move {
            maintain_peer(gw, peer).await;
        });
    }
}

/// Keep one reverse tunnel alive forever.
pub async fn maintain_peer(gateway: Arc<Gateway>, peer: PinnedPeer) {
    // Backoff state lives on one node record per pinned peer. The identity
    // may be unknown before the first successful handshake, so the dial
    // address stands in as the key.
    let backoff_key = peer
        .identity
        .clone()
        .unwrap_or_else(|| peer.address.clone());

    let mut state = TunnelState::Disconnected;
    loop {
        state = match state {
            TunnelState::Disconnected => TunnelState::Connecting,

            TunnelState::Connecting => match establish(&gateway, &peer).await {
                Ok(session) => TunnelState::Connected(session),
                Err(e) => {
                    warn!(address = %peer.address, error = %e, "reverse tunnel dial failed");
                    TunnelState::Backoff(gateway.nodes.get_or_create(&backoff_key).backoff_next())
                }
            },

            TunnelState::Connected(session) => {
                let peer_id = session.peer_id().to_string();
                gateway.nodes.get_or_create(&backoff_key).backoff_reset();
                info!(peer = %short_id(&peer_id), address = %peer.address, "reverse tunnel connected");

                match session.serve(&gateway).await {
                    Ok(()) => info!(peer = %short_id(&peer_id), "reverse tunnel session ended"),
                    Err(e) => {
                        warn!(peer = %short_id(&peer_id), error = %e, "reverse tunnel session failed")
                    }
                }
                TunnelState::Backoff(gateway.nodes.get_or_create(&backoff_key).backoff_next())
            }

            TunnelState::Backoff(delay) => {
                debug!(address = %peer.address, delay_ms = delay.as_millis() as u64, "reverse tunnel backoff");
                tokio::time::sleep(delay).await;
                TunnelState::Disconnected
            }
        };
    }
}

/// Dial, handshake, and negotiate the tunnel role.
async fn establish(gateway: &Arc<Gateway>, peer: &PinnedPeer) -> GateResult<Session> {
    let tcp = TcpStream::connect(&peer.address)
        .await
        .map_err(|e| GateError::Tunnel(format!("dial {}: {e}", peer.address)))?;

    let (tls, tls_info) = tls_connect(
        tcp,
        &gateway.identity,
        peer.identity.as_deref(),
        &["h2r", "h2"],
        None,
    )
    .await?;

    let peer_id = tls_info
        .peer_identity
        .clone()
        .ok_or_else(|| GateError::Tunnel("peer presented no certificate".into()))?;
    let node = gateway.nodes.get_or_create(&peer_id);
    node.set_addr(&peer.address);
    node.touch();

    match tls_info.alpn.as_deref() {
        Some("h2r") => Ok(Session::Reverse {
            io: Box::new(tls),
            peer_id,
        }),
        Some("h2") => {
            // fallback: the outer session is a normal forward muxer; the
            // reverse channel goes inside POST /h2r/
            let epoch = gateway.nodes.next_epoch();
            let node_for_close = node.clone();
            let mux = connect_muxer(Box::new(tls) as BoxConn, epoch, &peer_id, move || {
                node_for_close.clear_muxer(epoch);
            })
            .await?;
            node.set_muxer(mux.clone());

            let duplex = mux.open_reverse().await?;
            Ok(Session::Fallback {
                duplex,
                peer_id,
                mux_epoch: epoch,
            })
        }
        other => Err(GateError::Tunnel(format!(
            "peer negotiated unsupported ALPN {other:?}"
        ))),
    }
}

/// Accept side: an inbound connection negotiated ALPN `h2r`, so this side
/// opens the H2 client over it and publishes the muxer for the peer.
pub async fn accept_reverse(
    gateway: &Arc<Gateway>,
    io: BoxConn,
    info: &Arc<StreamInfo>,
) -> GateResult<()> {
    let peer = info
        .peer_identity()
        .ok_or_else(|| GateError::Tunnel("h2r requires a client certificate".into()))?;
    register_reverse_mux(gateway, io, peer).await
}

/// Open an H2 client over a freshly accepted reverse channel, run the
/// identification round-trip, publish the muxer in the node table, and hold
/// until the session ends (disassociating it then).
pub(crate) async fn register_reverse_mux<S>(
    gateway: &Arc<Gateway>,
    io: S,
    peer: String,
) -> GateResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let epoch = gateway.nodes.next_epoch();
    let node = gateway.nodes.get_or_create(&peer);

    let (closed_tx, closed_rx) = oneshot::channel::<()>();
    let node_for_close = node.clone();
    let mux = connect_muxer(io, epoch, &peer, move || {
        node_for_close.clear_muxer(epoch);
        let _ = closed_tx.send(());
    })
    .await?;

    // identification round-trip before the muxer becomes routable
    let id = mux.get(ID_PATH).await?;
    if id.as_ref() != peer.as_bytes() {
        return Err(GateError::Tunnel(format!(
            "reverse session identity mismatch: {}",
            String::from_utf8_lossy(&id)
        )));
    }

    node.set_muxer(mux);
    node.touch();
    info!(peer = %short_id(&peer), "reverse tunnel registered");

    let _ = closed_rx.await;
    debug!(peer = %short_id(&peer), "reverse tunnel disassociated");
    Ok(())
}
