//! Link ciphers.
//!
//! Every frame is sealed as a whole before it reaches a link. AEAD ciphers
//! use a fresh random 96-bit nonce per frame, carried after the ciphertext:
//!
//! ```text
//! [ciphertext + tag][nonce:12B]
//! ```

use crate::CipherError;
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// AEAD nonce size in bytes
pub const NONCE_SIZE: usize = 12;
/// AEAD authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Configured cipher family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    /// AES-GCM, 128 or 256 bit depending on the key length
    #[default]
    AesGcm,
    /// ChaCha20-Poly1305 with a 256 bit key
    Chacha20Poly1305,
}

/// Frame cipher shared by all links of a session
pub enum LinkCipher {
    /// No encryption
    Plain,
    /// AES-128-GCM
    Aes128Gcm(Box<Aes128Gcm>),
    /// AES-256-GCM
    Aes256Gcm(Box<Aes256Gcm>),
    /// ChaCha20-Poly1305
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl LinkCipher {
    /// Build a cipher from a hex secret; an empty secret selects [`LinkCipher::Plain`]
    pub fn new(kind: CipherKind, secret: &str) -> Result<Self, CipherError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Ok(LinkCipher::Plain);
        }
        let key = hex::decode(secret).map_err(|_| CipherError::InvalidSecret)?;
        match (kind, key.len()) {
            (CipherKind::AesGcm, 16) => Ok(LinkCipher::Aes128Gcm(Box::new(Aes128Gcm::new(
                GenericArray::from_slice(&key),
            )))),
            (CipherKind::AesGcm, 32) => Ok(LinkCipher::Aes256Gcm(Box::new(Aes256Gcm::new(
                GenericArray::from_slice(&key),
            )))),
            (CipherKind::Chacha20Poly1305, 32) => Ok(LinkCipher::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new(GenericArray::from_slice(&key)),
            ))),
            (kind, actual) => Err(CipherError::KeyLength {
                cipher: kind.name(),
                actual,
            }),
        }
    }

    /// Bytes added to every frame
    pub fn overhead(&self) -> usize {
        match self {
            LinkCipher::Plain => 0,
            _ => TAG_SIZE + NONCE_SIZE,
        }
    }

    /// Seal a frame
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_SIZE];
        let sealed = match self {
            LinkCipher::Plain => return Ok(plaintext.to_vec()),
            LinkCipher::Aes128Gcm(c) => c.encrypt(fresh_nonce(&mut nonce), plaintext),
            LinkCipher::Aes256Gcm(c) => c.encrypt(fresh_nonce(&mut nonce), plaintext),
            LinkCipher::ChaCha20Poly1305(c) => c.encrypt(fresh_nonce(&mut nonce), plaintext),
        };
        let mut out = sealed.map_err(|_| CipherError::Encryption)?;
        out.extend_from_slice(&nonce);
        Ok(out)
    }

    /// Open a sealed frame
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if let LinkCipher::Plain = self {
            return Ok(sealed.to_vec());
        }
        if sealed.len() < TAG_SIZE + NONCE_SIZE {
            return Err(CipherError::TooShort(sealed.len()));
        }
        let (body, nonce) = sealed.split_at(sealed.len() - NONCE_SIZE);
        let nonce = GenericArray::from_slice(nonce);

        let opened = match self {
            LinkCipher::Plain => Ok(body.to_vec()),
            LinkCipher::Aes128Gcm(c) => c.decrypt(nonce, body),
            LinkCipher::Aes256Gcm(c) => c.decrypt(nonce, body),
            LinkCipher::ChaCha20Poly1305(c) => c.decrypt(nonce, body),
        };
        opened.map_err(|_| CipherError::Authentication)
    }
}

fn fresh_nonce(nonce: &mut [u8; NONCE_SIZE]) -> &GenericArray<u8, chacha20poly1305::consts::U12> {
    rand::rngs::OsRng.fill_bytes(nonce);
    GenericArray::from_slice(nonce)
}

impl CipherKind {
    fn name(&self) -> &'static str {
        match self {
            CipherKind::AesGcm => "aes-gcm",
            CipherKind::Chacha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Debug for LinkCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkCipher::Plain => "plain",
            LinkCipher::Aes128Gcm(_) => "aes-128-gcm",
            LinkCipher::Aes256Gcm(_) => "aes-256-gcm",
            LinkCipher::ChaCha20Poly1305(_) => "chacha20-poly1305",
        };
        write!(f, "LinkCipher({})", name)
    }
}
