//! Long-term credential primitives (RFC 5389 section 15.4, RFC 5766).

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::stun::{self, ATTR_MESSAGE_INTEGRITY, STUN_HEADER_SIZE};

type HmacSha1 = Hmac<Sha1>;

/// Size of the MESSAGE-INTEGRITY attribute: 4-byte TLV header + 20-byte HMAC.
const MESSAGE_INTEGRITY_ATTR_SIZE: usize = 24;

/// Long-term credential key: `MD5(username ":" realm ":" password)`.
pub fn derive_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", username, realm, password).as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// HMAC-SHA1 (RFC 2104) of `data` under `key`.
pub fn hmac_sha1(data: &[u8], key: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// MESSAGE-INTEGRITY value for a message whose attributes so far are
/// `prefix` (header included).
///
/// The HMAC covers `prefix` only (the MESSAGE-INTEGRITY attribute header is
/// not part of the input), with the header length field rewritten as if the
/// message ended right after MESSAGE-INTEGRITY. `None` if `prefix` is
/// shorter than a STUN header.
pub fn message_integrity(prefix: &[u8], key: &[u8]) -> Option<[u8; 20]> {
    if prefix.len() < STUN_HEADER_SIZE {
        return None;
    }
    let mut input = prefix.to_vec();
    let len = prefix.len() - STUN_HEADER_SIZE + MESSAGE_INTEGRITY_ATTR_SIZE;
    stun::set_length(&mut input, len);
    Some(hmac_sha1(&input, key))
}

/// Append MESSAGE-INTEGRITY to `buf`, leaving the length field covering it.
pub fn append_message_integrity(buf: &mut Vec<u8>, key: &[u8]) {
    let Some(mac) = message_integrity(buf, key) else {
        return;
    };
    stun::append_attr(buf, ATTR_MESSAGE_INTEGRITY, &mac);
    stun::update_length(buf);
}

/// Append MESSAGE-INTEGRITY followed by FINGERPRINT.
pub fn sign(buf: &mut Vec<u8>, key: &[u8]) {
    append_message_integrity(buf, key);
    stun::append_fingerprint(buf);
}

/// Check the MESSAGE-INTEGRITY attribute of a received message.
pub fn verify_message_integrity(data: &[u8], key: &[u8]) -> bool {
    if data.len() < STUN_HEADER_SIZE {
        return false;
    }
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let attrs_end = (STUN_HEADER_SIZE + msg_len).min(data.len());

    let mut pos = STUN_HEADER_SIZE;
    while pos + 4 <= attrs_end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let start = pos + 4;

        if attr_type == ATTR_MESSAGE_INTEGRITY {
            if attr_len != 20 || start + 20 > attrs_end {
                return false;
            }
            return message_integrity(&data[..pos], key)
                .is_some_and(|mac| mac[..] == data[start..start + 20]);
        }
        pos = start + ((attr_len + 3) & !3);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Allocate request (txn 01..0c) carrying REQUESTED-TRANSPORT, USERNAME
    /// "alice", REALM "example.org" and NONCE, cut right where
    /// MESSAGE-INTEGRITY starts. The length field already counts the 24-byte
    /// MESSAGE-INTEGRITY attribute.
    const SIGNED_PREFIX: &str = "0003005c2112a4420102030405060708090a0b0c\
        001900041100000000060005616c6963650000000014000b6578616d706c652e6f7267\
        000015001c662f2f3439396b39353464364f4c33346f4c39465354767936347341";

    /// MD5("alice:example.org:secret").
    const KEY: &str = "543e1aec5d3614f03141652d6ada51b2";

    /// HMAC-SHA1 over exactly `SIGNED_PREFIX`.
    const EXPECTED_MI: &str = "242ed4eb746c686232fa81f13e6e1b5bcabdb787";

    /// What comes out when the MESSAGE-INTEGRITY TLV header (00 08 00 14) is
    /// hashed as well.
    const BROKEN_MI: &str = "9fe5a35e1329ec6b7764913365679246c1c25f52";

    #[test]
    fn test_derive_key() {
        assert_eq!(
            hex::encode(derive_key("alice", "example.org", "secret")),
            KEY
        );
        assert_eq!(
            hex::encode(derive_key("user", "realm", "pass")),
            "8493fbc53ba582fb4c044c456bdc40eb"
        );
    }

    #[test]
    fn test_hmac_sha1_reference() {
        let mac = hmac_sha1(b"The quick brown fox jumps over the lazy dog", b"key");
        assert_eq!(hex::encode(mac), "de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9");
    }

    #[test]
    fn test_hmac_sha1_long_key_is_hashed() {
        let long_key = [0xAAu8; 100];
        let mut mac = HmacSha1::new_from_slice(&long_key).unwrap();
        mac.update(b"data");
        let expected = mac.finalize().into_bytes();
        assert_eq!(&hmac_sha1(b"data", &long_key)[..], &expected[..]);
    }

    #[test]
    fn test_message_integrity_excludes_attribute_header() {
        let prefix = hex::decode(SIGNED_PREFIX).unwrap();
        let key = hex::decode(KEY).unwrap();

        assert_eq!(hex::encode(message_integrity(&prefix, &key).unwrap()), EXPECTED_MI);

        // Hashing the TLV header too is the historical bug: servers answer 401.
        let mut mutant = prefix.clone();
        mutant.extend_from_slice(&[0x00, 0x08, 0x00, 0x14]);
        let wrong = hmac_sha1(&mutant, &key);
        assert_eq!(hex::encode(wrong), BROKEN_MI);
        assert_ne!(hex::encode(wrong), EXPECTED_MI);
    }

    #[test]
    fn test_append_message_integrity_on_unsized_prefix() {
        // Same message with a stale length field: the function must fix it up.
        let mut buf = hex::decode(SIGNED_PREFIX).unwrap();
        let key = hex::decode(KEY).unwrap();
        stun::set_length(&mut buf, 0);

        append_message_integrity(&mut buf, &key);
        let len = buf.len();
        assert_eq!(&buf[len - 24..len - 20], &[0x00, 0x08, 0x00, 0x14]);
        assert_eq!(hex::encode(&buf[len - 20..]), EXPECTED_MI);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]) as usize, len - STUN_HEADER_SIZE);
    }

    #[test]
    fn test_sign_then_verify() {
        let mut buf = hex::decode(SIGNED_PREFIX).unwrap();
        let key = derive_key("alice", "example.org", "secret");
        sign(&mut buf, &key);

        assert!(verify_message_integrity(&buf, &key));
        assert!(!verify_message_integrity(&buf, b"wrongkey"));

        let mut tampered = buf.clone();
        tampered[30] ^= 0xFF;
        assert!(!verify_message_integrity(&tampered, &key));
    }

    #[test]
    fn test_message_integrity_needs_full_header() {
        assert_eq!(message_integrity(&[], b"key"), None);
        assert_eq!(message_integrity(&[0u8; STUN_HEADER_SIZE - 1], b"key"), None);
        assert!(message_integrity(&[0u8; STUN_HEADER_SIZE], b"key").is_some());

        let mut short = vec![0u8; 8];
        append_message_integrity(&mut short, b"key");
        assert_eq!(short, vec![0u8; 8]);
    }

    #[test]
    fn test_verify_without_integrity_attribute() {
        let buf = stun::build_binding_request(&[0u8; 12]);
        assert!(!verify_message_integrity(&buf, b"key"));
    }
}
