//! Webhook signature verification.
//!
//! The provider signs each delivery body with HMAC-SHA256 over a shared
//! secret and sends the hex digest in a header. Verification runs before
//! the body is parsed or the event id is claimed: an unverifiable delivery
//! must leave no trace, so the provider can retry it.

use sha2::{Digest, Sha256};

const BLOCK_LEN: usize = 64;

/// HMAC-SHA256 (RFC 2104) over `message` with `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut block = [0u8; BLOCK_LEN];
    if key.len() > BLOCK_LEN {
        let digest = Sha256::digest(key);
        block[..digest.len()].copy_from_slice(&digest);
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

/// Hex signature for an outbound or expected payload.
pub fn sign(secret: &str, body: &[u8]) -> String {
    hex::encode(hmac_sha256(secret.as_bytes(), body))
}

/// Check a provided hex signature against the body.
///
/// Comparison is constant-time so the check leaks nothing about how much
/// of a guessed signature matched.
pub fn verify(secret: &str, body: &[u8], provided: &str) -> bool {
    let expected = sign(secret, body);
    constant_time_eq(expected.as_bytes(), provided.trim().to_lowercase().as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2.
    #[test]
    fn test_hmac_known_vector() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    // RFC 4231 test case 1.
    #[test]
    fn test_hmac_binary_key() {
        let key = [0x0bu8; 20];
        let mac = hmac_sha256(&key, b"Hi There");
        assert_eq!(
            hex::encode(mac),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    // RFC 4231 test case 6: keys longer than the block are hashed first.
    #[test]
    fn test_hmac_oversized_key() {
        let key = [0xaau8; 131];
        let mac = hmac_sha256(
            &key,
            b"Test Using Larger Than Block-Size Key - Hash Key First",
        );
        assert_eq!(
            hex::encode(mac),
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }

    #[test]
    fn test_verify_round_trip() {
        let body = br#"{"id":"evt-1","type":"purchase.completed"}"#;
        let signature = sign("secret", body);
        assert!(verify("secret", body, &signature));
        assert!(verify("secret", body, &signature.to_uppercase()));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let body = br#"{"id":"evt-1"}"#;
        let signature = sign("secret", body);
        assert!(!verify("secret", br#"{"id":"evt-2"}"#, &signature));
        assert!(!verify("other-secret", body, &signature));
        assert!(!verify("secret", body, "deadbeef"));
    }
}
