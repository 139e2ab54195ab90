//! Rewrite functions for each anonymization strategy.

use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};

pub const ENVELOPE_PREFIX: &str = "ENC[";
pub const ENVELOPE_SUFFIX: &str = "]";
const NONCE_LEN: usize = 12;

pub(crate) fn redact(tag: &str) -> String {
    format!("[{}_REDACTED]", tag)
}

/// Unsalted SHA-256 pseudonym, stable across processes.
pub(crate) fn hash(tag: &str, matched: &str) -> String {
    let digest = Sha256::digest(matched.as_bytes());
    format!("{}_{}", tag, hex::encode(&digest[..8]))
}

/// Digits become digits and letters become letters of the same case; everything else
/// is kept so the value keeps its shape.
pub(crate) fn randomize_preserving(matched: &str) -> String {
    let mut rng = rand::thread_rng();
    matched
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                char::from(rng.gen_range(b'0'..=b'9'))
            } else if c.is_ascii_lowercase() {
                char::from(rng.gen_range(b'a'..=b'z'))
            } else if c.is_ascii_uppercase() {
                char::from(rng.gen_range(b'A'..=b'Z'))
            } else {
                c
            }
        })
        .collect()
}

pub(crate) fn randomize_opaque() -> String {
    let mut rng = rand::thread_rng();
    let body: String = (0..16)
        .map(|_| char::from(rng.sample(rand::distributions::Alphanumeric)))
        .collect();
    format!("RND_{}", body)
}

/// Reversible envelope: `ENC[base64(nonce || ciphertext)]`.
pub(crate) struct EnvelopeCipher {
    cipher: ChaCha20Poly1305,
}

impl EnvelopeCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("encryption failed: {}", e))?;
        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(nonce.as_slice());
        framed.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}{}",
            ENVELOPE_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(framed),
            ENVELOPE_SUFFIX
        ))
    }

    pub fn open(&self, envelope: &str) -> Option<String> {
        let body = envelope
            .strip_prefix(ENVELOPE_PREFIX)?
            .strip_suffix(ENVELOPE_SUFFIX)?;
        let framed = base64::engine::general_purpose::STANDARD
            .decode(body)
            .ok()?;
        if framed.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/// In-process token table. Keys are digests so raw values are not retained.
#[derive(Debug, Default)]
pub(crate) struct TokenTable {
    tokens: DashMap<String, String>,
}

impl TokenTable {
    pub fn token_for(&self, matched: &str) -> String {
        let key = hex::encode(Sha256::digest(matched.as_bytes()));
        self.tokens
            .entry(key)
            .or_insert_with(|| format!("TOK_{}", uuid::Uuid::new_v4().simple()))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}
