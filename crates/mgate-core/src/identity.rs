//! Mesh identities derived from public keys.
//!
//! An identity is the lowercase hex SHA-256 of a certificate's
//! SubjectPublicKeyInfo. There is no CA hierarchy: two peers presenting the
//! same key are the same identity, regardless of address or transport.

use sha2::{Digest, Sha256};

/// Length of a full identity string (SHA-256 = 32 bytes = 64 hex chars).
pub const IDENTITY_LEN: usize = 64;

/// Compute the identity for a public key (SubjectPublicKeyInfo DER bytes).
pub fn identity_from_spki(spki_der: &[u8]) -> String {
    let hash = Sha256::digest(spki_der);
    hex::encode(hash)
}

/// Short display form of an identity, for logs.
pub fn short_id(id: &str) -> &str {
    &id[..12.min(id.len())]
}

/// Whether a destination host component looks like a mesh identity rather
/// than a hostname or IP.
pub fn is_identity(host: &str) -> bool {
    host.len() == IDENTITY_LEN && host.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn identity_is_hex_sha256() {
        let key = b"spki-bytes-for-some-public-key";
        let id = identity_from_spki(key);
        assert_eq!(id.len(), IDENTITY_LEN);
        assert!(is_identity(&id));
    }

    #[test]
    fn identity_is_stable() {
        let key = b"the-same-key";
        assert_eq!(identity_from_spki(key), identity_from_spki(key));
    }

    #[test]
    fn distinct_keys_do_not_collide() {
        let mut rng = rand::thread_rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let mut key = [0u8; 91]; // typical EC SPKI size
            rng.fill_bytes(&mut key);
            assert!(seen.insert(identity_from_spki(&key)));
        }
    }

    #[test]
    fn hostnames_are_not_identities() {
        assert!(!is_identity("example.com"));
        assert!(!is_identity("127.0.0.1"));
        // right length, wrong alphabet
        let s = "g".repeat(IDENTITY_LEN);
        assert!(!is_identity(&s));
    }
}
