//! mgate-core: shared library for the mgate mesh gateway.
//!
//! Leaf building blocks with no knowledge of listeners or routing: the
//! [`stream::Stream`] abstraction and its lifecycle accounting, the wire
//! [`sniff`]er, public-key [`identity`] derivation, and HMAC bearer
//! [`token`]s.

pub mod error;
pub mod identity;
pub mod sniff;
pub mod stream;
pub mod token;

pub use error::{GateError, GateResult};
pub use identity::{identity_from_spki, is_identity, short_id};
pub use sniff::{classify, parse_client_hello, sniff_stream, PrefixedStream, Sniffed};
pub use stream::{BoxConn, Conn, Stream, StreamGuard, StreamInfo, StreamSnapshot, StreamTable, TlsInfo};
pub use token::{create_token, generate_secret, verify_token};
