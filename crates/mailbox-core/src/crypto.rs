//! The master-key envelope for persisted secrets.
//!
//! The master key is Argon2id over either the user's master password
//! or, when none is set, a host-stable identity string. The identity
//! fallback provides only a minimal level of protection, which is
//! acceptable because everything sealed with it is recoverable: an
//! account password can be re-prompted and the cache re-downloaded.
//!
//! Blob layout:
//!
//! ```text
//! IV (16) ‖ AES-256-CFB( BLAKE2b-512(data) ‖ data )
//! ```
//!
//! The recovered checksum is compared in constant time on decrypt.

use aes::Aes256;
use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use blake2::{Blake2b512, Digest};
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// AES block / IV size in bytes.
const IV_SIZE: usize = 16;

/// BLAKE2b-512 digest size in bytes.
const CHECKSUM_SIZE: usize = 64;

/// Argon2 salt size in bytes.
const SALT_SIZE: usize = 64;

/// Errors from key derivation and blob handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The stored salt is not valid hex of the right length.
    #[error("invalid master key salt")]
    InvalidSalt,

    /// Wrong key or corrupted data.
    #[error("invalid key or corrupted data")]
    InvalidKey,

    /// The blob is shorter than IV + checksum.
    #[error("encrypted blob is truncated")]
    Truncated,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// The derived application-wide master key.
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    /// Derives the key from a password and the stored hex salt
    /// (Argon2id, 64 MiB, 1 pass, 2 lanes).
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed salt or derivation failure.
    pub fn derive(pass: &str, salt_hex: &str) -> Result<Self, CryptoError> {
        let salt = hex::decode(salt_hex).map_err(|_| CryptoError::InvalidSalt)?;
        if salt.len() != SALT_SIZE {
            return Err(CryptoError::InvalidSalt);
        }

        let params = argon2::Params::new(64 * 1024, 1, 2, Some(32))
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        let argon = argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        );

        let mut key = [0_u8; 32];
        argon
            .hash_password_into(pass.as_bytes(), &salt, &mut key)
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        Ok(Self { key })
    }

    /// Generates a fresh random salt in the stored (hex) form.
    #[must_use]
    pub fn generate_salt() -> String {
        let mut salt = [0_u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        hex::encode(salt)
    }

    /// Seals a blob: random IV, checksum-prefixed plaintext, CFB.
    #[must_use]
    pub fn encrypt(&self, blob: &[u8]) -> Vec<u8> {
        let mut iv = [0_u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let checksum = Blake2b512::digest(blob);
        let mut buf = Vec::with_capacity(CHECKSUM_SIZE + blob.len());
        buf.extend_from_slice(&checksum);
        buf.extend_from_slice(blob);

        Aes256CfbEnc::new(&self.key.into(), &iv.into()).encrypt(&mut buf);

        let mut out = Vec::with_capacity(IV_SIZE + buf.len());
        out.extend_from_slice(&iv);
        out.append(&mut buf);
        out
    }

    /// Opens a blob sealed by [`MasterKey::encrypt`], verifying the
    /// checksum in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] on checksum mismatch and
    /// [`CryptoError::Truncated`] on short input.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < IV_SIZE + CHECKSUM_SIZE {
            return Err(CryptoError::Truncated);
        }
        let (iv, ciphertext) = blob.split_at(IV_SIZE);

        let mut buf = ciphertext.to_vec();
        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| CryptoError::Truncated)?;
        Aes256CfbDec::new(&self.key.into(), &iv.into()).decrypt(&mut buf);

        let (checksum, data) = buf.split_at(CHECKSUM_SIZE);
        let expected = Blake2b512::digest(data);
        if checksum.ct_eq(expected.as_slice()).into() {
            Ok(data.to_vec())
        } else {
            Err(CryptoError::InvalidKey)
        }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// A host-stable identity string used in place of a master password
/// when the user has not set one.
#[must_use]
pub fn system_identity() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default();
    let host = std::env::var("HOSTNAME").unwrap_or_default();
    format!("{}:{user}:{home}:{host}", std::env::consts::OS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pass: &str) -> MasterKey {
        // Fixed salt keeps derivation deterministic for the test.
        MasterKey::derive(pass, &"00".repeat(64)).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = key("hunter2");
        let sealed = key.encrypt(b"account password");
        assert_ne!(sealed, b"account password");
        assert_eq!(key.decrypt(&sealed).unwrap(), b"account password");
    }

    #[test]
    fn blob_layout() {
        let key = key("hunter2");
        let sealed = key.encrypt(b"xy");
        assert_eq!(sealed.len(), IV_SIZE + CHECKSUM_SIZE + 2);
    }

    #[test]
    fn distinct_ivs_give_distinct_blobs() {
        let key = key("hunter2");
        assert_ne!(key.encrypt(b"same"), key.encrypt(b"same"));
    }

    #[test]
    fn wrong_key_is_detected() {
        let sealed = key("hunter2").encrypt(b"secret");
        assert_eq!(
            key("wrong").decrypt(&sealed).unwrap_err(),
            CryptoError::InvalidKey
        );
    }

    #[test]
    fn corrupted_blob_is_detected() {
        let key = key("hunter2");
        let mut sealed = key.encrypt(b"secret");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(key.decrypt(&sealed).unwrap_err(), CryptoError::InvalidKey);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let key = key("hunter2");
        assert_eq!(
            key.decrypt(&[0_u8; 10]).unwrap_err(),
            CryptoError::Truncated
        );
    }

    #[test]
    fn bad_salt_is_rejected() {
        assert_eq!(
            MasterKey::derive("x", "zz").unwrap_err(),
            CryptoError::InvalidSalt
        );
        assert_eq!(
            MasterKey::derive("x", "abcd").unwrap_err(),
            CryptoError::InvalidSalt
        );
    }

    #[test]
    fn generated_salt_derives() {
        let salt = MasterKey::generate_salt();
        assert_eq!(salt.len(), 128);
        assert!(MasterKey::derive("pw", &salt).is_ok());
    }
}
