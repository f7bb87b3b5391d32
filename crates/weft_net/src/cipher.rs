//! Session framing crypto — padded, header-tagged, encrypted text frames.
//!
//! Pre-handshake frames are the literal `"<header> <base64(json)>"` string.
//! Post-handshake frames are `"<ivB64> <payloadB64> <tagB64>"`: the
//! header-tagged body is padded on both ends with short random strings whose
//! lengths ride as two leading digits (decorrelating ciphertext length from
//! message length), then encrypted in one of two modes.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::NetError;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const GCM_IV_LEN: usize = 12;
const CTR_IV_LEN: usize = 16;
const GCM_TAG_LEN: usize = 16;

/// Post-handshake framing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherMode {
    /// AES-256-GCM; the auth tag is transmitted alongside the ciphertext.
    Gcm,
    /// AES-256-CTR with a separate HMAC-SHA256 tag over IV‖ciphertext.
    CtrHmac,
}

/// Header tag carried by every framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Application data.
    Data,
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Session establishment.
    Handshake,
}

impl FrameKind {
    /// The wire header string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Handshake => "handshake",
        }
    }

    /// Parse a wire header string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data" => Some(Self::Data),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "handshake" => Some(Self::Handshake),
            _ => None,
        }
    }
}

// ── Hashing, noise, key derivation ──────────────────────────────────────

/// Fresh per-session noise: 32 random bytes, hex encoded.
pub fn random_noise() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Challenge proof: `hex(SHA-256(noise ∥ salt ∥ secret))`.
pub fn proof(noise: &str, salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(noise.as_bytes());
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the 32-byte session key with Argon2id, salted by
/// `SHA-256(server_noise ∥ client_noise)`. Deterministic: both peers derive
/// the identical key once both noises are known.
pub fn derive_session_key(
    secret: &str,
    server_noise: &str,
    client_noise: &str,
) -> Result<[u8; 32], NetError> {
    let mut hasher = Sha256::new();
    hasher.update(server_noise.as_bytes());
    hasher.update(client_noise.as_bytes());
    let salt = hasher.finalize();

    let params = Params::new(19456, 2, 1, Some(32))
        .map_err(|e| NetError::Crypto(format!("Bad KDF parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret.as_bytes(), &salt, &mut key)
        .map_err(|e| NetError::Crypto(format!("Key derivation failed: {e}")))?;
    Ok(key)
}

// ── Clear (pre-handshake) framing ───────────────────────────────────────

/// Encode a clear frame: `"<header> <base64(json)>"`.
pub fn encode_clear(kind: FrameKind, value: &Value) -> Result<String, NetError> {
    let json = serde_json::to_vec(value)?;
    Ok(format!("{} {}", kind.as_str(), B64.encode(json)))
}

/// Decode a clear frame back into its header and JSON body.
pub fn decode_clear(frame: &str) -> Result<(FrameKind, Value), NetError> {
    let (header, body) = frame
        .split_once(' ')
        .ok_or_else(|| NetError::MalformedFrame("missing header separator".into()))?;
    let kind = FrameKind::parse(header)
        .ok_or_else(|| NetError::MalformedFrame(format!("unknown header {header:?}")))?;
    let json = B64
        .decode(body)
        .map_err(|e| NetError::MalformedFrame(format!("bad base64 body: {e}")))?;
    let value = serde_json::from_slice(&json)?;
    Ok((kind, value))
}

// ── Padding ─────────────────────────────────────────────────────────────

/// Pad both ends with 1..=9 random characters each; the two lengths ride
/// as two leading digits.
fn pad(body: &str) -> String {
    let front = (rand::random::<u8>() % 9 + 1) as usize;
    let back = (rand::random::<u8>() % 9 + 1) as usize;
    let filler = hex::encode(rand::random::<[u8; 9]>());
    format!(
        "{front}{back}{}{body}{}",
        &filler[..front],
        &filler[filler.len() - back..]
    )
}

/// Strip the two leading pad-length digits and both pads.
fn unpad(padded: &str) -> Result<&str, NetError> {
    let bytes = padded.as_bytes();
    if bytes.len() < 2 {
        return Err(NetError::MalformedFrame("plaintext too short".into()));
    }
    let front = (bytes[0] as char)
        .to_digit(10)
        .ok_or_else(|| NetError::MalformedFrame("bad pad length prefix".into()))?
        as usize;
    let back = (bytes[1] as char)
        .to_digit(10)
        .ok_or_else(|| NetError::MalformedFrame("bad pad length prefix".into()))?
        as usize;

    let start = 2 + front;
    if bytes.len() < start + back {
        return Err(NetError::MalformedFrame("pad lengths exceed plaintext".into()));
    }
    padded
        .get(start..bytes.len() - back)
        .ok_or_else(|| NetError::MalformedFrame("pad split off a char boundary".into()))
}

// ── Session cipher ──────────────────────────────────────────────────────

/// Symmetric framing cipher scoped to one transport connection.
#[derive(Clone)]
pub struct SessionCipher {
    mode: CipherMode,
    key: [u8; 32],
}

impl SessionCipher {
    /// Build a cipher from a derived session key.
    pub fn new(mode: CipherMode, key: [u8; 32]) -> Self {
        Self { mode, key }
    }

    /// The framing mode in use.
    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Seal a message: header-tag, pad, encrypt, frame.
    pub fn seal(&self, kind: FrameKind, value: &Value) -> Result<String, NetError> {
        let body = encode_clear(kind, value)?;
        let padded = pad(&body);

        match self.mode {
            CipherMode::Gcm => {
                let iv: [u8; GCM_IV_LEN] = rand::random();
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
                let mut ciphertext = cipher
                    .encrypt(Nonce::from_slice(&iv), padded.as_bytes())
                    .map_err(|_| NetError::Crypto("AES-GCM encryption failed".into()))?;
                let tag = ciphertext.split_off(ciphertext.len() - GCM_TAG_LEN);
                Ok(format!(
                    "{} {} {}",
                    B64.encode(iv),
                    B64.encode(&ciphertext),
                    B64.encode(&tag)
                ))
            }
            CipherMode::CtrHmac => {
                let iv: [u8; CTR_IV_LEN] = rand::random();
                let mut buf = padded.into_bytes();
                let mut ctr = Aes256Ctr::new_from_slices(&self.key, &iv)
                    .map_err(|_| NetError::Crypto("Bad AES-CTR key/IV length".into()))?;
                ctr.apply_keystream(&mut buf);

                let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
                    .map_err(|_| NetError::Crypto("Bad HMAC key length".into()))?;
                mac.update(&iv);
                mac.update(&buf);
                let tag = mac.finalize().into_bytes();
                Ok(format!(
                    "{} {} {}",
                    B64.encode(iv),
                    B64.encode(&buf),
                    B64.encode(tag)
                ))
            }
        }
    }

    /// Open a sealed frame: verify, decrypt, unpad, parse.
    pub fn open(&self, frame: &str) -> Result<(FrameKind, Value), NetError> {
        let mut parts = frame.split(' ');
        let (Some(iv_b64), Some(payload_b64), Some(tag_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(NetError::MalformedFrame(
                "expected \"<iv> <payload> <tag>\"".into(),
            ));
        };

        let decode = |part: &str, what: &str| {
            B64.decode(part)
                .map_err(|e| NetError::MalformedFrame(format!("bad base64 {what}: {e}")))
        };
        let iv = decode(iv_b64, "iv")?;
        let payload = decode(payload_b64, "payload")?;
        let tag = decode(tag_b64, "tag")?;

        let plaintext = match self.mode {
            CipherMode::Gcm => {
                if iv.len() != GCM_IV_LEN {
                    return Err(NetError::Crypto("Bad AES-GCM IV length".into()));
                }
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
                let mut joined = payload;
                joined.extend_from_slice(&tag);
                cipher
                    .decrypt(Nonce::from_slice(&iv), joined.as_slice())
                    .map_err(|_| NetError::Crypto("AES-GCM authentication failed".into()))?
            }
            CipherMode::CtrHmac => {
                let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
                    .map_err(|_| NetError::Crypto("Bad HMAC key length".into()))?;
                mac.update(&iv);
                mac.update(&payload);
                mac.verify_slice(&tag)
                    .map_err(|_| NetError::Crypto("HMAC verification failed".into()))?;

                let mut buf = payload;
                let mut ctr = Aes256Ctr::new_from_slices(&self.key, &iv)
                    .map_err(|_| NetError::Crypto("Bad AES-CTR key/IV length".into()))?;
                ctr.apply_keystream(&mut buf);
                buf
            }
        };

        let padded = String::from_utf8(plaintext)
            .map_err(|_| NetError::Crypto("Decrypted frame is not UTF-8".into()))?;
        let body = unpad(&padded)?;
        decode_clear(body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_cipher(mode: CipherMode) -> SessionCipher {
        SessionCipher::new(mode, [0x42; 32])
    }

    #[test]
    fn test_clear_frame_roundtrip() {
        let value = json!({"keyword": "ahoy", "n": 7});
        let frame = encode_clear(FrameKind::Handshake, &value).unwrap();
        assert!(frame.starts_with("handshake "));

        let (kind, parsed) = decode_clear(&frame).unwrap();
        assert_eq!(kind, FrameKind::Handshake);
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_clear_frame_rejects_unknown_header() {
        let result = decode_clear("bogus aGk=");
        assert!(matches!(result, Err(NetError::MalformedFrame(_))));
    }

    #[test]
    fn test_pad_roundtrip() {
        for _ in 0..50 {
            let body = "data SGVsbG8=";
            let padded = pad(body);
            assert_eq!(unpad(&padded).unwrap(), body);
            // Two digits plus 1..=9 characters on each side.
            assert!(padded.len() >= body.len() + 4);
            assert!(padded.len() <= body.len() + 20);
        }
    }

    #[test]
    fn test_unpad_rejects_garbage() {
        assert!(unpad("x").is_err());
        assert!(unpad("zz-not-digits").is_err());
        assert!(unpad("99ab").is_err());
    }

    #[test]
    fn test_seal_open_roundtrip_gcm() {
        let cipher = test_cipher(CipherMode::Gcm);
        let value = json!({"hello": [1, 2, 3]});
        let frame = cipher.seal(FrameKind::Data, &value).unwrap();
        assert_eq!(frame.split(' ').count(), 3);

        let (kind, parsed) = cipher.open(&frame).unwrap();
        assert_eq!(kind, FrameKind::Data);
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_seal_open_roundtrip_ctr_hmac() {
        let cipher = test_cipher(CipherMode::CtrHmac);
        let value = json!({"ping": true});
        let frame = cipher.seal(FrameKind::Ping, &value).unwrap();

        let (kind, parsed) = cipher.open(&frame).unwrap();
        assert_eq!(kind, FrameKind::Ping);
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_identical_messages_produce_distinct_frames() {
        let cipher = test_cipher(CipherMode::Gcm);
        let value = json!("same");
        let a = cipher.seal(FrameKind::Data, &value).unwrap();
        let b = cipher.seal(FrameKind::Data, &value).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_open() {
        for mode in [CipherMode::Gcm, CipherMode::CtrHmac] {
            let frame = test_cipher(mode).seal(FrameKind::Data, &json!("x")).unwrap();
            let other = SessionCipher::new(mode, [0x43; 32]);
            assert!(matches!(other.open(&frame), Err(NetError::Crypto(_))));
        }
    }

    #[test]
    fn test_tampered_payload_fails_open() {
        for mode in [CipherMode::Gcm, CipherMode::CtrHmac] {
            let cipher = test_cipher(mode);
            let frame = cipher.seal(FrameKind::Data, &json!("x")).unwrap();

            // Flip one character inside the payload part.
            let mut parts: Vec<String> = frame.split(' ').map(String::from).collect();
            let mut payload = B64.decode(&parts[1]).unwrap();
            payload[0] ^= 0xFF;
            parts[1] = B64.encode(&payload);
            let tampered = parts.join(" ");

            assert!(matches!(cipher.open(&tampered), Err(NetError::Crypto(_))));
        }
    }

    #[test]
    fn test_malformed_frame_shape_rejected() {
        let cipher = test_cipher(CipherMode::Gcm);
        assert!(cipher.open("only-two parts").is_err());
        assert!(cipher.open("a b c d").is_err());
        assert!(cipher.open("!!! ### $$$").is_err());
    }

    #[test]
    fn test_derive_session_key_is_deterministic() {
        let k1 = derive_session_key("secret", "noise-s", "noise-c").unwrap();
        let k2 = derive_session_key("secret", "noise-s", "noise-c").unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_derive_session_key_depends_on_all_inputs() {
        let base = derive_session_key("secret", "noise-s", "noise-c").unwrap();
        assert_ne!(base, derive_session_key("other", "noise-s", "noise-c").unwrap());
        assert_ne!(base, derive_session_key("secret", "noise-x", "noise-c").unwrap());
        assert_ne!(base, derive_session_key("secret", "noise-s", "noise-x").unwrap());
    }

    #[test]
    fn test_proof_is_stable_and_sensitive() {
        let p1 = proof("noise", "salt-1", "secret");
        assert_eq!(p1, proof("noise", "salt-1", "secret"));
        assert_ne!(p1, proof("noise", "salt-2", "secret"));
        assert_ne!(p1, proof("noise", "salt-1", "other"));
        assert_eq!(p1.len(), 64);
    }

    #[test]
    fn test_noise_is_random_hex() {
        let a = random_noise();
        let b = random_noise();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
