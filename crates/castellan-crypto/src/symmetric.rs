//! Symmetric-mode E4 key.

use crate::{e4, C2KeyRotationTx, CryptoError, E4Key, GeneratedKey};

/// Symmetric E4 key material.
///
/// Clients hold a single symmetric device key; commands are protected with
/// the deterministic AEAD directly under that key. There is no C2 keypair
/// in this mode, so rotation requests are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymmetricE4Key;

impl SymmetricE4Key {
    pub fn new() -> Self {
        Self
    }
}

impl E4Key for SymmetricE4Key {
    fn validate_key(&self, key: &[u8]) -> Result<(), CryptoError> {
        e4::validate_sym_key(key)
    }

    fn random_key(&self) -> Result<GeneratedKey, CryptoError> {
        let key = e4::random_sym_key();
        Ok(GeneratedKey {
            wire: key.clone(),
            stored: key,
        })
    }

    fn protect_command(&self, command: &[u8], client_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        e4::encrypt(client_key, command)
    }

    fn is_pubkey_mode(&self) -> bool {
        false
    }

    fn new_c2_key_rotation_tx(&self) -> Result<Box<dyn C2KeyRotationTx>, CryptoError> {
        Err(CryptoError::InvalidCryptoMode)
    }
}
