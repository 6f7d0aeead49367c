//! Listener registry and accept loops.
//!
//! One OS listener per non-virtual config, each with its own accept-loop
//! task cancellable through an `mpsc` channel. Virtual (`-`-prefixed)
//! configs are registered for port lookup only — they answer for mesh
//! deliveries to this node without binding a socket.

use crate::config::ListenerConfig;
use crate::router::Gateway;
use mgate_core::{GateError, GateResult};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delay before retrying accept after a transient error.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

struct ListenerEntry {
    cfg: Arc<ListenerConfig>,
    cancel_tx: Option<mpsc::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

/// Owns all listeners for one gateway.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<Vec<ListenerEntry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind (or, for virtual configs, just register) a listener and start
    /// its accept loop. Returns the bound address for real listeners —
    /// useful with `":0"` ephemeral requests.
    pub async fn add(
        &self,
        gateway: &Arc<Gateway>,
        cfg: ListenerConfig,
    ) -> GateResult<Option<SocketAddr>> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);

        if cfg.is_virtual() {
            debug!(address = %cfg.address, "virtual listener registered");
            self.entries.lock().unwrap().push(ListenerEntry {
                cfg,
                cancel_tx: None,
                local_addr: None,
            });
            return Ok(None);
        }

        let bind_addr = match cfg.address.as_str() {
            "" | ":0" => "127.0.0.1:0".to_string(),
            other => other.to_string(),
        };
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| GateError::Config(format!("bind {bind_addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        self.entries.lock().unwrap().push(ListenerEntry {
            cfg: cfg.clone(),
            cancel_tx: Some(cancel_tx),
            local_addr: Some(local_addr),
        });

        info!(
            address = %local_addr,
            protocol = cfg.protocol.tag(),
            "listener started"
        );

        let gw = gateway.clone();
        tokio::spawn(async move {
            accept_loop(gw, listener, cfg, cancel_rx).await;
        });

        Ok(Some(local_addr))
    }

    /// Stop every accept loop. Virtual entries stay registered.
    pub async fn close_all(&self) {
        let senders: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.cancel_tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(()).await;
        }
    }

    /// Find the config answering for `port` — bound or virtual.
    pub fn find_by_port(&self, port: u16) -> Option<Arc<ListenerConfig>> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|e| {
                e.local_addr.map(|a| a.port()) == Some(port) || e.cfg.port() == Some(port)
            })
            .map(|e| e.cfg.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accept loop for one bound listener.
///
/// Transient accept errors retry after a short delay; anything else stops
/// this loop only — other listeners and live streams are unaffected.
async fn accept_loop(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    cfg: Arc<ListenerConfig>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(address = %cfg.address, "accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((tcp, peer_addr)) => {
                        debug!(address = %cfg.address, peer = %peer_addr, "connection accepted");
                        let gw = gateway.clone();
                        let cfg = cfg.clone();
                        tokio::spawn(async move {
                            gw.handle_accepted(tcp, cfg).await;
                        });
                    }
                    Err(e) if is_transient(&e) => {
                        warn!(address = %cfg.address, error = %e, "transient accept error");
                        tokio::time::sleep(ACCEPT_RETRY).await;
                    }
                    Err(e) => {
                        warn!(address = %cfg.address, error = %e, "accept loop stopped");
                        break;
                    }
                }
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(libc_emfile())
}

// EMFILE without pulling in libc: stable on every unix we target.
fn libc_emfile() -> i32 {
    24
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    #[test]
    fn transient_errors_are_recognized() {
        assert!(is_transient(&std::io::Error::from(
            std::io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_transient(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }

    #[test]
    fn virtual_listener_found_by_port() {
        let registry = ListenerRegistry::new();
        registry.entries.lock().unwrap().push(ListenerEntry {
            cfg: Arc::new(ListenerConfig {
                address: "-:15012".into(),
                protocol: Protocol::Virtual,
                forward_to: None,
                alpn: Vec::new(),
                handler: Some("echo".into()),
            }),
            cancel_tx: None,
            local_addr: None,
        });
        assert!(registry.find_by_port(15012).is_some());
        assert!(registry.find_by_port(15013).is_none());
    }
}
