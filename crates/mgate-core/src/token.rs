//! HMAC bearer tokens.
//!
//! Used by peers that cannot present a client certificate: the token binds a
//! subject (the peer identity) to an expiry time, signed with a shared mesh
//! secret. Wire format, hex encoded:
//! `[8-byte expiry][1-byte subject len][subject][32-byte HMAC-SHA256]`

use crate::error::{GateError, GateResult};
use ring::hmac;

const HMAC_LEN: usize = 32;

/// Create a bearer token for `subject`, valid for `ttl_secs`.
pub fn create_token(secret: &[u8], subject: &str, ttl_secs: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let expiry = now + ttl_secs;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::new();
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(subject.as_bytes());
    let tag = hmac::sign(&key, &data);

    let mut token = Vec::with_capacity(8 + 1 + subject.len() + HMAC_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.push(subject.len() as u8);
    token.extend_from_slice(subject.as_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Verify a bearer token, returning its subject.
///
/// Checks the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], token: &str) -> GateResult<String> {
    let raw = hex::decode(token).map_err(|_| GateError::Token("not hex".into()))?;
    if raw.len() < 8 + 1 + HMAC_LEN {
        return Err(GateError::Token(format!("token too short: {}", raw.len())));
    }

    let expiry_bytes: [u8; 8] = raw[..8].try_into().unwrap();
    let expiry = u64::from_be_bytes(expiry_bytes);
    let subject_len = raw[8] as usize;
    if raw.len() != 8 + 1 + subject_len + HMAC_LEN {
        return Err(GateError::Token("bad subject length".into()));
    }
    let subject = std::str::from_utf8(&raw[9..9 + subject_len])
        .map_err(|_| GateError::Token("subject not utf-8".into()))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    if now > expiry {
        return Err(GateError::Token("token expired".into()));
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::new();
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(subject.as_bytes());
    hmac::verify(&key, &data, &raw[9 + subject_len..])
        .map_err(|_| GateError::Token("invalid token signature".into()))?;

    Ok(subject.to_string())
}

/// Generate a random mesh secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret).expect("RNG failure");
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let secret = generate_secret();
        let token = create_token(&secret, "abc123", 3600);
        assert_eq!(verify_token(&secret, &token).unwrap(), "abc123");
    }

    #[test]
    fn wrong_secret() {
        let secret1 = generate_secret();
        let secret2 = generate_secret();
        let token = create_token(&secret1, "abc123", 3600);
        assert!(verify_token(&secret2, &token).is_err());
    }

    #[test]
    fn tampered_subject() {
        let secret = generate_secret();
        let token = create_token(&secret, "abc123", 3600);
        let mut raw = hex::decode(&token).unwrap();
        raw[9] ^= 0xff;
        assert!(verify_token(&secret, &hex::encode(raw)).is_err());
    }

    #[test]
    fn expired_token() {
        let secret = generate_secret();
        let mut raw = hex::decode(create_token(&secret, "abc123", 3600)).unwrap();
        // rewrite the expiry into the past; signature no longer matches either,
        // but the expiry check runs first
        raw[..8].copy_from_slice(&1u64.to_be_bytes());
        assert!(matches!(
            verify_token(&secret, &hex::encode(raw)),
            Err(GateError::Token(msg)) if msg.contains("expired")
        ));
    }

    #[test]
    fn not_hex() {
        let secret = generate_secret();
        assert!(verify_token(&secret, "zz-not-hex").is_err());
    }
}
