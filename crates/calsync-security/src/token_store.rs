use crate::SecurityError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const PBKDF2_ROUNDS: u32 = 210_000;
const AESGCM_PREFIX: &str = "aesgcm:";
const OBF1_PREFIX: &str = "obf1:";
const OBF_LEGACY_PREFIX: &str = "obf:";

/// Labels the encoding layer actually protecting a stored refresh token,
/// for display (spec.md §4.8 "labeled mode string").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    MemoryOnly,
    Obfuscated,
    AesWrapped,
}

impl StorageMode {
    pub fn label(&self) -> &'static str {
        match self {
            StorageMode::MemoryOnly => "memory-only",
            StorageMode::Obfuscated => "obfuscated",
            StorageMode::AesWrapped => "AES-wrapped",
        }
    }

    pub fn of_encoded(stored: &str) -> StorageMode {
        if stored.starts_with(AESGCM_PREFIX) {
            StorageMode::AesWrapped
        } else if stored.starts_with(OBF1_PREFIX) || stored.starts_with(OBF_LEGACY_PREFIX) {
            StorageMode::Obfuscated
        } else {
            StorageMode::MemoryOnly
        }
    }
}

/// Encodes a refresh token for at-rest storage. Uses the `aesgcm:` layer
/// when a passphrase is available, otherwise falls back to `obf1:`
/// (spec.md §4.8: "outermost layer applied wins"). Plaintext access
/// tokens are never passed to this function by callers.
pub fn encode(plaintext: &str, passphrase: Option<&str>, salt: &[u8]) -> String {
    match passphrase {
        Some(passphrase) => encode_aesgcm(plaintext, passphrase, salt),
        None => encode_obf1(plaintext, salt),
    }
}

/// Decodes a stored token, accepting all three layers. Returns whether
/// the stored form should be rewritten (legacy `obf:` is always
/// re-encoded as `obf1:` on next write, per spec.md §4.8).
pub fn decode(stored: &str, passphrase: Option<&str>, salt: &[u8]) -> Result<(String, bool), SecurityError> {
    if let Some(body) = stored.strip_prefix(AESGCM_PREFIX) {
        let Some(passphrase) = passphrase else {
            return Err(SecurityError::PassphraseRequired);
        };
        return Ok((decode_aesgcm(body, passphrase, salt)?, false));
    }
    if let Some(body) = stored.strip_prefix(OBF1_PREFIX) {
        return Ok((decode_obf1(body, salt)?, false));
    }
    if let Some(body) = stored.strip_prefix(OBF_LEGACY_PREFIX) {
        return Ok((decode_obf_legacy(body, salt)?, true));
    }
    Err(SecurityError::Integrity)
}

fn derive_aes_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

fn encode_aesgcm(plaintext: &str, passphrase: &str, salt: &[u8]) -> String {
    let key_bytes = derive_aes_key(passphrase, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .expect("aes-gcm encryption over an in-memory buffer cannot fail");

    let mut payload = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);

    format!("{AESGCM_PREFIX}{}", BASE64.encode(payload))
}

fn decode_aesgcm(body: &str, passphrase: &str, salt: &[u8]) -> Result<String, SecurityError> {
    let raw = BASE64.decode(body).map_err(|_| SecurityError::Integrity)?;
    if raw.len() < 12 {
        return Err(SecurityError::Integrity);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(12);

    let key_bytes = derive_aes_key(passphrase, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SecurityError::Integrity)?;

    String::from_utf8(plaintext).map_err(|_| SecurityError::Integrity)
}

fn obf1_key(salt: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(salt).expect("hmac accepts any key length");
    mac.update(b"obf1");
    mac.finalize().into_bytes().to_vec()
}

fn keystream(key: &[u8], iv: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 0;
    while out.len() < len {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(iv);
        mac.update(&counter.to_be_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn encode_obf1(plaintext: &str, salt: &[u8]) -> String {
    let key = obf1_key(salt);

    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);

    let stream = keystream(&key, &iv, plaintext.len());
    let ciphertext: Vec<u8> = plaintext
        .as_bytes()
        .iter()
        .zip(stream.iter())
        .map(|(p, k)| p ^ k)
        .collect();

    let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(&iv);
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(iv.len() + ciphertext.len() + tag.len());
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&tag);

    format!("{OBF1_PREFIX}{}", BASE64.encode(payload))
}

fn decode_obf1(body: &str, salt: &[u8]) -> Result<String, SecurityError> {
    let raw = BASE64.decode(body).map_err(|_| SecurityError::Integrity)?;
    if raw.len() < 16 + 32 {
        return Err(SecurityError::Integrity);
    }
    let (iv, rest) = raw.split_at(16);
    let (ciphertext, tag) = rest.split_at(rest.len() - 32);

    let key = obf1_key(salt);

    let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_slice(tag).map_err(|_| SecurityError::Integrity)?;

    let stream = keystream(&key, iv, ciphertext.len());
    let plaintext: Vec<u8> = ciphertext.iter().zip(stream.iter()).map(|(c, k)| c ^ k).collect();
    String::from_utf8(plaintext).map_err(|_| SecurityError::Integrity)
}

fn decode_obf_legacy(body: &str, salt: &[u8]) -> Result<String, SecurityError> {
    let raw = BASE64.decode(body).map_err(|_| SecurityError::Integrity)?;
    let keystream = Sha256::digest(salt);
    let plaintext: Vec<u8> = raw
        .iter()
        .zip(keystream.iter().cycle())
        .map(|(c, k)| c ^ k)
        .collect();
    String::from_utf8(plaintext).map_err(|_| SecurityError::Integrity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aesgcm_round_trips() {
        let salt = b"per-install-salt";
        let encoded = encode("refresh-token-value", Some("correct horse"), salt);
        assert!(encoded.starts_with(AESGCM_PREFIX));
        let (plaintext, needs_reencode) = decode(&encoded, Some("correct horse"), salt).expect("decodes");
        assert_eq!(plaintext, "refresh-token-value");
        assert!(!needs_reencode);
    }

    #[test]
    fn aesgcm_wrong_passphrase_is_integrity_error() {
        let salt = b"per-install-salt";
        let encoded = encode("secret", Some("right"), salt);
        let result = decode(&encoded, Some("wrong"), salt);
        assert!(matches!(result, Err(SecurityError::Integrity)));
    }

    #[test]
    fn obf1_round_trips_without_passphrase() {
        let salt = b"per-install-salt";
        let encoded = encode("refresh-token-value", None, salt);
        assert!(encoded.starts_with(OBF1_PREFIX));
        let (plaintext, needs_reencode) = decode(&encoded, None, salt).expect("decodes");
        assert_eq!(plaintext, "refresh-token-value");
        assert!(!needs_reencode);
    }

    #[test]
    fn obf1_tampered_mac_is_rejected() {
        let salt = b"per-install-salt";
        let encoded = encode("refresh-token-value", None, salt);
        let mut tampered = encoded.clone();
        tampered.push('x');
        assert!(decode(&tampered, None, salt).is_err());
    }

    #[test]
    fn legacy_obf_decodes_and_signals_reencode() {
        let salt = b"per-install-salt";
        let keystream = Sha256::digest(salt);
        let plaintext = b"legacy-refresh-token";
        let ciphertext: Vec<u8> = plaintext.iter().zip(keystream.iter().cycle()).map(|(p, k)| p ^ k).collect();
        let legacy = format!("{OBF_LEGACY_PREFIX}{}", BASE64.encode(ciphertext));

        let (decoded, needs_reencode) = decode(&legacy, None, salt).expect("decodes legacy");
        assert_eq!(decoded, "legacy-refresh-token");
        assert!(needs_reencode);
    }

    #[test]
    fn storage_mode_label_reflects_layer() {
        assert_eq!(StorageMode::of_encoded("aesgcm:abc").label(), "AES-wrapped");
        assert_eq!(StorageMode::of_encoded("obf1:abc").label(), "obfuscated");
        assert_eq!(StorageMode::of_encoded("obf:abc").label(), "obfuscated");
    }
}
