//! Key material encoding
//!
//! Keys are written as URL-safe base64 without padding. Reading is lenient:
//! raw 32 bytes, 64 hex characters, or any base64 flavour (optionally
//! prefixed with `base64:`) are accepted as long as they decode to exactly
//! 32 bytes.

use super::{DbKey, KEY_LEN};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use zeroize::Zeroizing;

fn trim_bytes(raw: &[u8]) -> &[u8] {
    let start = raw.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &raw[start..end]
}

/// Decode stored key material into a key
pub fn decode_key_material(raw: &[u8]) -> Result<DbKey, String> {
    let raw = trim_bytes(raw);
    if raw.is_empty() {
        return Err("dbkey payload is empty".to_string());
    }
    if raw.len() == KEY_LEN {
        return DbKey::from_slice(raw);
    }

    let text = Zeroizing::new(String::from_utf8_lossy(raw).trim().to_string());
    let text = text.strip_prefix("base64:").map(str::trim).unwrap_or(text.as_str());

    if text.len() == KEY_LEN * 2 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Ok(bytes) = hex::decode(text) {
            let bytes = Zeroizing::new(bytes);
            if bytes.len() == KEY_LEN {
                return DbKey::from_slice(&bytes);
            }
        }
    }

    for engine in [&URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD] {
        if let Ok(bytes) = engine.decode(text.as_bytes()) {
            let bytes = Zeroizing::new(bytes);
            if bytes.len() == KEY_LEN {
                return DbKey::from_slice(&bytes);
            }
        }
    }

    Err("dbkey must decode to exactly 32 bytes".to_string())
}

/// Canonical text form written to backends
pub fn encode_key(key: &DbKey) -> Zeroizing<String> {
    Zeroizing::new(URL_SAFE_NO_PAD.encode(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> [u8; KEY_LEN] {
        let mut bytes = [0u8; KEY_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            // Includes bytes that differ between standard and URL-safe alphabets
            *b = (i as u8).wrapping_mul(37).wrapping_add(250);
        }
        bytes
    }

    #[test]
    fn test_accepts_all_encodings() {
        let bytes = sample();
        let expected = DbKey::from_slice(&bytes).unwrap();

        let forms = vec![
            URL_SAFE_NO_PAD.encode(bytes),
            URL_SAFE.encode(bytes),
            STANDARD.encode(bytes),
            format!("base64:{}", STANDARD.encode(bytes)),
            hex::encode(bytes),
            hex::encode_upper(bytes),
            format!("  {}\n", URL_SAFE_NO_PAD.encode(bytes)),
        ];
        for form in forms {
            let key = decode_key_material(form.as_bytes()).unwrap();
            assert_eq!(key.as_bytes(), expected.as_bytes(), "form {}", form);
        }

        let raw = decode_key_material(&[b'k'; KEY_LEN]).unwrap();
        assert_eq!(raw.as_bytes(), &[b'k'; KEY_LEN]);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(decode_key_material(b"").is_err());
        assert!(decode_key_material(b"   \n").is_err());
        assert!(decode_key_material(STANDARD.encode([1u8; 16]).as_bytes()).is_err());
        assert!(decode_key_material(b"not a key at all").is_err());
    }

    #[test]
    fn test_encode_is_url_safe_unpadded() {
        let key = DbKey::from_slice(&sample()).unwrap();
        let text = encode_key(&key);
        assert!(!text.contains('='));
        assert!(!text.contains('+'));
        assert!(!text.contains('/'));
        let back = decode_key_material(text.as_bytes()).unwrap();
        assert_eq!(back.as_bytes(), key.as_bytes());
    }
}
