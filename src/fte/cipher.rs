//! FTE cipher
//!
//! AEAD encryption whose ciphertext is re-encoded as a ranked string of the
//! cover regex. The key is derived from the document UUID; both parties hold
//! the same document, so no negotiation happens on the wire.
//!
//! # Blob layout
//!
//! ```text
//! [version:1][plaintext_len:4][nonce:12][ciphertext || tag:16][zero padding]
//! ```
//!
//! The blob is right-padded to the ranker's byte capacity, interpreted as a
//! big-endian integer, and unranked into a length-`n` covertext. Decryption
//! ranks the covertext prefix, left-pads the integer bytes back to the blob
//! width, and undoes the framing.

use crate::error::{Error, Result};
use crate::fte::Dfa;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};

/// Framing version byte
pub const FTE_VERSION: u8 = 1;

const HEADER_LEN: usize = 5;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Fixed bytes of the blob that are not plaintext
pub const FTE_OVERHEAD: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

const KEY_LABEL: &[u8] = b"marionette fte key v1";

/// A cover-regex/length pair bound to an AEAD key
pub struct FteCipher {
    dfa: Dfa,
    aead: Aes256Gcm,
    n: usize,
    blob_len: usize,
}

impl std::fmt::Debug for FteCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FteCipher")
            .field("n", &self.n)
            .field("blob_len", &self.blob_len)
            .finish()
    }
}

impl FteCipher {
    /// Build a cipher for `regex` at covertext length `msg_len`, keyed from
    /// `key_material` (the document UUID bytes).
    pub fn new(regex: &str, msg_len: usize, key_material: &[u8]) -> Result<Self> {
        let dfa = Dfa::new(regex, msg_len)?;
        let bits = dfa.capacity()?;
        let blob_len = bits / 8;
        if blob_len <= FTE_OVERHEAD {
            return Err(Error::CapacityTooSmall { regex: regex.into(), msg_len });
        }

        let mut hasher = Sha256::new();
        hasher.update(KEY_LABEL);
        hasher.update(key_material);
        let key = hasher.finalize();
        let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        Ok(Self { dfa, aead, n: msg_len, blob_len })
    }

    /// Covertext length in bytes
    pub fn msg_len(&self) -> usize {
        self.n
    }

    /// Maximum plaintext length per covertext
    pub fn capacity(&self) -> usize {
        self.blob_len - FTE_OVERHEAD
    }

    /// Encrypt `plaintext` into a length-`n` string of the cover language.
    /// Each call draws a fresh nonce and is independent of every other call.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > self.capacity() {
            return Err(Error::PayloadTooLarge(plaintext.len(), self.capacity()));
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Io("aead encryption failed".into()))?;

        let mut blob = Vec::with_capacity(self.blob_len);
        blob.push(FTE_VERSION);
        blob.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        blob.resize(self.blob_len, 0);

        self.dfa.unrank(&BigUint::from_bytes_be(&blob))
    }

    /// Decrypt the length-`n` prefix of `covertext`; bytes past the prefix
    /// come back untouched as the remainder.
    pub fn decrypt(&self, covertext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        if covertext.len() < self.n {
            return Err(Error::ShortRead);
        }
        let (prefix, remainder) = covertext.split_at(self.n);

        let rank = self.dfa.rank(prefix)?;
        let raw = rank.to_bytes_be();
        if raw.len() > self.blob_len {
            return Err(Error::Malformed("ciphertext wider than blob".into()));
        }
        let mut blob = vec![0u8; self.blob_len - raw.len()];
        blob.extend_from_slice(&raw);

        if blob[0] != FTE_VERSION {
            return Err(Error::Malformed(format!("unknown framing version: {}", blob[0])));
        }
        let plaintext_len = u32::from_be_bytes([blob[1], blob[2], blob[3], blob[4]]) as usize;
        if plaintext_len > self.capacity() {
            return Err(Error::Malformed(format!("plaintext length {plaintext_len} exceeds capacity")));
        }

        let nonce = Nonce::from_slice(&blob[HEADER_LEN..HEADER_LEN + NONCE_LEN]);
        let ct_start = HEADER_LEN + NONCE_LEN;
        let ciphertext = &blob[ct_start..ct_start + plaintext_len + TAG_LEN];

        let plaintext = self.aead.decrypt(nonce, ciphertext).map_err(|_| Error::AuthFailed)?;
        Ok((plaintext, remainder.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> FteCipher {
        FteCipher::new("^(a|b|c)+$", 512, &123u32.to_be_bytes()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let cipher = test_cipher();

        let covertext = cipher.encrypt(b"test").unwrap();
        assert_eq!(covertext.len(), 512);
        assert!(covertext.iter().all(|b| matches!(b, b'a' | b'b' | b'c')));

        let (plaintext, remainder) = cipher.decrypt(&covertext).unwrap();
        assert_eq!(plaintext, b"test");
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_second_message_independent() {
        let cipher = test_cipher();
        let _ = cipher.encrypt(b"test").unwrap();

        let covertext = cipher.encrypt(b"foo bar").unwrap();
        let (plaintext, remainder) = cipher.decrypt(&covertext).unwrap();
        assert_eq!(plaintext, b"foo bar");
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_remainder_passed_through() {
        let cipher = test_cipher();
        let mut wire = cipher.encrypt(b"head").unwrap();
        wire.extend_from_slice(b"tail");

        let (plaintext, remainder) = cipher.decrypt(&wire).unwrap();
        assert_eq!(plaintext, b"head");
        assert_eq!(remainder, b"tail");
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let cipher = test_cipher();
        let other = FteCipher::new("^(a|b|c)+$", 512, &456u32.to_be_bytes()).unwrap();

        let covertext = cipher.encrypt(b"secret").unwrap();
        assert!(matches!(other.decrypt(&covertext), Err(Error::AuthFailed)));
    }

    #[test]
    fn test_short_covertext() {
        let cipher = test_cipher();
        let covertext = cipher.encrypt(b"x").unwrap();
        assert!(matches!(cipher.decrypt(&covertext[..511]), Err(Error::ShortRead)));
    }

    #[test]
    fn test_capacity_bound() {
        let cipher = test_cipher();
        let cap = cipher.capacity();
        assert!(cap > 0);

        let big = vec![0u8; cap + 1];
        assert!(matches!(cipher.encrypt(&big), Err(Error::PayloadTooLarge(..))));

        let exact = vec![7u8; cap];
        let covertext = cipher.encrypt(&exact).unwrap();
        let (plaintext, _) = cipher.decrypt(&covertext).unwrap();
        assert_eq!(plaintext, exact);
    }

    #[test]
    fn test_insufficient_capacity_rejected_at_build() {
        // One word of length 4: zero bits of capacity.
        let err = FteCipher::new("^abcd$", 4, b"k");
        assert!(matches!(err, Err(Error::CapacityTooSmall { .. })));
    }
}
