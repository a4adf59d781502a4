//! E4 primitives: alias hashing, key validation, deterministic AEAD.
//!
//! The AEAD is deliberately deterministic: the nonce is synthesised from the
//! plaintext under a key-derived MAC key, so re-protecting the same bytes
//! under the same key yields a byte-identical output. Stored keys rely on
//! this for idempotent re-encryption, command protection for replayable
//! publishes.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use sha3::{Digest, Sha3_256};

use crate::CryptoError;

/// Length of symmetric keys and Ed25519 key halves, in bytes.
pub const KEY_LEN: usize = 32;

/// Length of a client identifier, in bytes.
pub const ID_LEN: usize = 16;

/// Maximum length of a client name alias, in bytes.
pub const NAME_MAX_LEN: usize = 255;

/// AEAD nonce length, in bytes.
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length, in bytes.
pub const TAG_LEN: usize = 16;

const NONCE_INFO: &[u8] = b"castellan.nonce.v1";

/// Hash a client name alias into its identifier.
///
/// SHA3-256 truncated to [`ID_LEN`]; deterministic for a given name.
pub fn hash_id_alias(name: &str) -> [u8; ID_LEN] {
    let digest = Sha3_256::digest(name.as_bytes());
    let mut id = [0u8; ID_LEN];
    id.copy_from_slice(&digest[..ID_LEN]);
    id
}

/// Validate a client name alias.
pub fn validate_name(name: &str) -> Result<(), CryptoError> {
    if name.is_empty() {
        return Err(CryptoError::InvalidName("name must not be empty".into()));
    }
    if name.len() > NAME_MAX_LEN {
        return Err(CryptoError::InvalidName(format!(
            "name must not exceed {} bytes",
            NAME_MAX_LEN
        )));
    }
    Ok(())
}

/// Validate a client identifier.
pub fn validate_id(id: &[u8]) -> Result<(), CryptoError> {
    if id.len() != ID_LEN {
        return Err(CryptoError::InvalidIdLen {
            got: id.len(),
            want: ID_LEN,
        });
    }
    Ok(())
}

/// Validate a symmetric key: exact length, not all-zero.
pub fn validate_sym_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLen {
            got: key.len(),
            want: KEY_LEN,
        });
    }
    if key.iter().all(|&b| b == 0) {
        return Err(CryptoError::InvalidKey);
    }
    Ok(())
}

/// Generate a fresh random symmetric key.
pub fn random_sym_key() -> Vec<u8> {
    let mut key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt `plaintext` under `key` with the deterministic AEAD.
///
/// Output layout: `nonce (12) ‖ ciphertext ‖ tag (16)`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    validate_sym_key(key)?;

    let nonce = synthetic_nonce(key, plaintext)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`].
pub fn decrypt(key: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    validate_sym_key(key)?;

    if payload.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::CiphertextTooShort);
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Protect an application payload under a topic key.
pub fn protect_sym_key(payload: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt(key, payload)
}

/// Recover an application payload protected by [`protect_sym_key`].
pub fn unprotect_sym_key(payload: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    decrypt(key, payload)
}

/// Synthesise the AEAD nonce from the plaintext.
///
/// nonce = HMAC-SHA256(HKDF(key, "castellan.nonce.v1"), plaintext)[..12]
fn synthetic_nonce(key: &[u8], plaintext: &[u8]) -> Result<[u8; NONCE_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, key);
    let mut nonce_key = [0u8; KEY_LEN];
    hk.expand(NONCE_INFO, &mut nonce_key)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(&nonce_key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    mac.update(plaintext);
    let digest = mac.finalize().into_bytes();

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_id_alias_is_deterministic() {
        for name in ["test1", "testtest2", "e4test3", "test4", "test5"] {
            assert_eq!(hash_id_alias(name), hash_id_alias(name));
            assert_eq!(hash_id_alias(name).len(), ID_LEN);
        }
        assert_ne!(hash_id_alias("alice"), hash_id_alias("bob"));
    }

    #[test]
    fn validate_sym_key_rejects_bad_keys() {
        assert!(matches!(
            validate_sym_key(&[1u8; 16]),
            Err(CryptoError::InvalidKeyLen { got: 16, want: 32 })
        ));
        assert_eq!(validate_sym_key(&[0u8; 32]), Err(CryptoError::InvalidKey));
        assert!(validate_sym_key(&random_sym_key()).is_ok());
    }

    #[test]
    fn validate_name_bounds() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(NAME_MAX_LEN)).is_ok());
        assert!(validate_name(&"x".repeat(NAME_MAX_LEN + 1)).is_err());
    }

    #[test]
    fn encrypt_round_trips() {
        let key = random_sym_key();
        let plaintext = b"some client key material";

        let protected = encrypt(&key, plaintext).unwrap();
        assert_ne!(&protected[NONCE_LEN..], plaintext.as_slice());

        let recovered = decrypt(&key, &protected).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn encrypt_is_deterministic() {
        let key = random_sym_key();
        let a = encrypt(&key, b"payload").unwrap();
        let b = encrypt(&key, b"payload").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decrypt_rejects_tampering() {
        let key = random_sym_key();
        let mut protected = encrypt(&key, b"payload").unwrap();
        let last = protected.len() - 1;
        protected[last] ^= 0x01;
        assert_eq!(decrypt(&key, &protected), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let protected = encrypt(&random_sym_key(), b"payload").unwrap();
        assert_eq!(
            decrypt(&random_sym_key(), &protected),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn decrypt_rejects_truncated_payload() {
        let key = random_sym_key();
        assert_eq!(
            decrypt(&key, &[0u8; NONCE_LEN + TAG_LEN - 1]),
            Err(CryptoError::CiphertextTooShort)
        );
    }
}
