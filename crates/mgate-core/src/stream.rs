//! Stream metadata and lifecycle accounting.
//!
//! A [`Stream`] is one logical bidirectional connection — accepted from a
//! listener, or opened virtually over a multiplexer. Everything past accept
//! operates on Streams, never raw sockets. The driving task owns the Stream;
//! the [`StreamTable`] holds a non-owning `Arc` to its [`StreamInfo`] for
//! introspection, and a [`StreamGuard`] makes terminal accounting fire
//! exactly once no matter which side closed first.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

/// Object-safe byte-stream capability. One concrete [`Stream`] type owns a
/// boxed `Conn` instead of a type hierarchy over TCP / TLS / H2 streams.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> Conn for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxConn = Box<dyn Conn>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Negotiated TLS state attached to a stream after termination.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TlsInfo {
    /// Negotiated ALPN protocol, if any.
    pub alpn: Option<String>,
    /// Peer identity derived from the client/server certificate.
    pub peer_identity: Option<String>,
    /// SNI observed during sniffing or termination.
    pub sni: Option<String>,
}

#[derive(Debug, Default)]
struct StreamMeta {
    dest: String,
    stream_type: String,
    listener: Option<String>,
    tls: Option<TlsInfo>,
}

#[derive(Debug, Default)]
struct StreamErrors {
    read: Option<String>,
    write: Option<String>,
    proxy_read: Option<String>,
    proxy_write: Option<String>,
}

/// Shared metadata and counters for one stream.
///
/// `dest` and `stream_type` are set once by the sniffer / TLS layer; the
/// router only refines `dest` during address resolution. Counters and
/// timestamps are mutated by the proxy loop alone.
#[derive(Debug)]
pub struct StreamInfo {
    pub stream_id: u64,
    meta: Mutex<StreamMeta>,
    errors: Mutex<StreamErrors>,

    /// Bytes/packets received from the originating side.
    pub rcvd_bytes: AtomicU64,
    pub rcvd_packets: AtomicU64,
    /// Bytes/packets sent back to the originating side.
    pub sent_bytes: AtomicU64,
    pub sent_packets: AtomicU64,

    open: Instant,
    /// Milliseconds since `open`, updated by the proxy loop.
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

impl StreamInfo {
    pub fn new(stream_type: &str) -> Self {
        Self {
            stream_id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            meta: Mutex::new(StreamMeta {
                stream_type: stream_type.to_string(),
                ..Default::default()
            }),
            errors: Mutex::new(StreamErrors::default()),
            rcvd_bytes: AtomicU64::new(0),
            rcvd_packets: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            sent_packets: AtomicU64::new(0),
            open: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
        }
    }

    pub fn dest(&self) -> String {
        self.meta.lock().unwrap().dest.clone()
    }

    pub fn set_dest(&self, dest: &str) {
        self.meta.lock().unwrap().dest = dest.to_string();
    }

    pub fn stream_type(&self) -> String {
        self.meta.lock().unwrap().stream_type.clone()
    }

    pub fn set_stream_type(&self, t: &str) {
        self.meta.lock().unwrap().stream_type = t.to_string();
    }

    pub fn set_listener(&self, name: &str) {
        self.meta.lock().unwrap().listener = Some(name.to_string());
    }

    pub fn tls(&self) -> Option<TlsInfo> {
        self.meta.lock().unwrap().tls.clone()
    }

    pub fn set_tls(&self, tls: TlsInfo) {
        self.meta.lock().unwrap().tls = Some(tls);
    }

    /// Peer identity, when the stream was TLS-terminated with a client cert.
    pub fn peer_identity(&self) -> Option<String> {
        self.meta
            .lock()
            .unwrap()
            .tls
            .as_ref()
            .and_then(|t| t.peer_identity.clone())
    }

    pub fn note_read(&self, n: usize) {
        self.rcvd_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.rcvd_packets.fetch_add(1, Ordering::Relaxed);
        self.last_read_ms
            .store(self.open.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn note_write(&self, n: usize) {
        self.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.last_write_ms
            .store(self.open.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_read_err(&self, e: &str) {
        self.errors.lock().unwrap().read.get_or_insert_with(|| e.to_string());
    }

    pub fn set_write_err(&self, e: &str) {
        self.errors.lock().unwrap().write.get_or_insert_with(|| e.to_string());
    }

    pub fn set_proxy_read_err(&self, e: &str) {
        self.errors
            .lock()
            .unwrap()
            .proxy_read
            .get_or_insert_with(|| e.to_string());
    }

    pub fn set_proxy_write_err(&self, e: &str) {
        self.errors
            .lock()
            .unwrap()
            .proxy_write
            .get_or_insert_with(|| e.to_string());
    }

    pub fn has_errors(&self) -> bool {
        let e = self.errors.lock().unwrap();
        e.read.is_some() || e.write.is_some() || e.proxy_read.is_some() || e.proxy_write.is_some()
    }

    pub fn age(&self) -> std::time::Duration {
        self.open.elapsed()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let meta = self.meta.lock().unwrap();
        let errors = self.errors.lock().unwrap();
        StreamSnapshot {
            stream_id: self.stream_id,
            dest: meta.dest.clone(),
            stream_type: meta.stream_type.clone(),
            listener: meta.listener.clone(),
            tls: meta.tls.clone(),
            rcvd_bytes: self.rcvd_bytes.load(Ordering::Relaxed),
            rcvd_packets: self.rcvd_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            age_ms: self.open.elapsed().as_millis() as u64,
            read_err: errors.read.clone(),
            write_err: errors.write.clone(),
            proxy_read_err: errors.proxy_read.clone(),
            proxy_write_err: errors.proxy_write.clone(),
        }
    }
}

/// Point-in-time copy of one stream's state, for the debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub stream_id: u64,
    pub dest: String,
    pub stream_type: String,
    pub listener: Option<String>,
    pub tls: Option<TlsInfo>,
    pub rcvd_bytes: u64,
    pub rcvd_packets: u64,
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub age_ms: u64,
    pub read_err: Option<String>,
    pub write_err: Option<String>,
    pub proxy_read_err: Option<String>,
    pub proxy_write_err: Option<String>,
}

/// One logical connection: metadata plus the byte-stream capability.
pub struct Stream {
    pub info: Arc<StreamInfo>,
    pub io: BoxConn,
}

impl Stream {
    pub fn new(stream_type: &str, io: BoxConn) -> Self {
        Self {
            info: Arc::new(StreamInfo::new(stream_type)),
            io,
        }
    }
}

/// Table of active streams, keyed by stream id.
///
/// Mutated only by whole-value insert/remove under a coarse rwlock; the
/// aggregate error counters survive stream removal.
#[derive(Debug, Default)]
pub struct StreamTable {
    inner: RwLock<HashMap<u64, Arc<StreamInfo>>>,
    pub total_accepted: AtomicU64,
    pub err_read: AtomicU64,
    pub err_write: AtomicU64,
    pub err_proxy_read: AtomicU64,
    pub err_proxy_write: AtomicU64,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, info: Arc<StreamInfo>) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.inner.write().unwrap().insert(info.stream_id, info);
    }

    /// Remove a stream. Returns false if it was already removed — the
    /// single-fire property of terminal accounting rests on this.
    pub fn remove(&self, stream_id: u64) -> bool {
        self.inner.write().unwrap().remove(&stream_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<StreamSnapshot> {
        self.inner
            .read()
            .unwrap()
            .values()
            .map(|s| s.snapshot())
            .collect()
    }
}

/// Runs terminal accounting for a stream exactly once.
///
/// Dropping the guard (normal return, error return, or unwind out of a
/// panicking handler) performs the same close path as [`StreamGuard::finish`]:
/// unregister from the table, bump error counters, emit the terminal log line.
pub struct StreamGuard {
    table: Arc<StreamTable>,
    info: Arc<StreamInfo>,
    done: bool,
}

impl StreamGuard {
    pub fn new(table: Arc<StreamTable>, info: Arc<StreamInfo>) -> Self {
        table.track(info.clone());
        Self {
            table,
            info,
            done: false,
        }
    }

    pub fn info(&self) -> &Arc<StreamInfo> {
        &self.info
    }

    /// Explicit close. Idempotent; Drop calls this too.
    pub fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if !self.table.remove(self.info.stream_id) {
            return;
        }

        let snap = self.info.snapshot();
        if snap.read_err.is_some() {
            self.table.err_read.fetch_add(1, Ordering::Relaxed);
        }
        if snap.write_err.is_some() {
            self.table.err_write.fetch_add(1, Ordering::Relaxed);
        }
        if snap.proxy_read_err.is_some() {
            self.table.err_proxy_read.fetch_add(1, Ordering::Relaxed);
        }
        if snap.proxy_write_err.is_some() {
            self.table.err_proxy_write.fetch_add(1, Ordering::Relaxed);
        }

        if self.info.has_errors() {
            warn!(
                stream_id = snap.stream_id,
                read_err = snap.read_err.as_deref().unwrap_or(""),
                write_err = snap.write_err.as_deref().unwrap_or(""),
                proxy_read_err = snap.proxy_read_err.as_deref().unwrap_or(""),
                proxy_write_err = snap.proxy_write_err.as_deref().unwrap_or(""),
                "stream errors"
            );
        }
        info!(
            stream_id = snap.stream_id,
            stream_type = %snap.stream_type,
            dest = %snap.dest,
            rcvd = snap.rcvd_bytes,
            rcvd_packets = snap.rcvd_packets,
            sent = snap.sent_bytes,
            sent_packets = snap.sent_packets,
            age_ms = snap.age_ms,
            "stream closed"
        );
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dest_and_type_are_settable_once_by_convention() {
        let info = StreamInfo::new("tcp");
        info.set_dest("example.com:443");
        assert_eq!(info.dest(), "example.com:443");
        assert_eq!(info.stream_type(), "tcp");
    }

    #[test]
    fn counters_accumulate() {
        let info = StreamInfo::new("tcp");
        info.note_read(100);
        info.note_read(50);
        info.note_write(25);
        let snap = info.snapshot();
        assert_eq!(snap.rcvd_bytes, 150);
        assert_eq!(snap.rcvd_packets, 2);
        assert_eq!(snap.sent_bytes, 25);
        assert_eq!(snap.sent_packets, 1);
    }

    #[test]
    fn first_error_wins() {
        let info = StreamInfo::new("tcp");
        info.set_read_err("first");
        info.set_read_err("second");
        assert_eq!(info.snapshot().read_err.as_deref(), Some("first"));
    }

    #[test]
    fn guard_fires_once() {
        let table = Arc::new(StreamTable::new());
        let info = Arc::new(StreamInfo::new("tcp"));
        let id = info.stream_id;

        let mut guard = StreamGuard::new(table.clone(), info);
        assert_eq!(table.len(), 1);

        guard.finish();
        assert_eq!(table.len(), 0);

        // second finish and the Drop are no-ops
        guard.finish();
        drop(guard);
        assert!(!table.remove(id));
    }

    #[test]
    fn guard_fires_on_drop() {
        let table = Arc::new(StreamTable::new());
        let info = Arc::new(StreamInfo::new("tcp"));
        {
            let _guard = StreamGuard::new(table.clone(), info);
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn guard_fires_on_panic() {
        let table = Arc::new(StreamTable::new());
        let info = Arc::new(StreamInfo::new("tcp"));
        let t = table.clone();
        let handle = tokio::spawn(async move {
            let _guard = StreamGuard::new(t, info);
            panic!("handler blew up");
        });
        assert!(handle.await.is_err());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn error_counters_survive_removal() {
        let table = Arc::new(StreamTable::new());
        let info = Arc::new(StreamInfo::new("tcp"));
        info.set_read_err("reset by peer");
        let mut guard = StreamGuard::new(table.clone(), info);
        guard.finish();
        assert_eq!(table.err_read.load(Ordering::Relaxed), 1);
        assert_eq!(table.err_write.load(Ordering::Relaxed), 0);
    }
}
