//! E4 cryptographic module.
//!
//! Covers the three crypto concerns of the control plane:
//! - at-rest protection of stored client and topic keys (deterministic AEAD),
//! - protection of commands published to clients, in symmetric or public-key
//!   mode behind the [`E4Key`] trait,
//! - the staged rotation of the C2 keypair in public-key mode.

pub mod e4;
mod pubkey;
mod symmetric;

pub use pubkey::{shared_key, PubKeyE4Key};
pub use symmetric::SymmetricE4Key;

use thiserror::Error;

/// Errors from cryptographic operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: got {got}, want {want}")]
    InvalidKeyLen { got: usize, want: usize },

    #[error("invalid key")]
    InvalidKey,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid id length: got {got}, want {want}")]
    InvalidIdLen { got: usize, want: usize },

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("operation not supported by the current crypto mode")]
    InvalidCryptoMode,

    #[error("a C2 key rotation is already in progress")]
    RotationInProgress,
}

/// A freshly generated client key pair of wire and stored halves.
///
/// In symmetric mode both halves are the same symmetric key. In public-key
/// mode `wire` is the client's new private key (sent to the device) and
/// `stored` is the matching public key retained by the C2.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub wire: Vec<u8>,
    pub stored: Vec<u8>,
}

/// The C2-side key material driving command protection.
///
/// Implementations are mode-specific; the service only sees this trait.
pub trait E4Key: Send + Sync {
    /// Check that `key` is acceptable client key material for this mode.
    fn validate_key(&self, key: &[u8]) -> Result<(), CryptoError>;

    /// Generate fresh client key material.
    fn random_key(&self) -> Result<GeneratedKey, CryptoError>;

    /// Protect a serialised command for the client holding `client_key`.
    ///
    /// Deterministic: protecting the same command under the same key yields a
    /// byte-identical payload.
    fn protect_command(&self, command: &[u8], client_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Whether this key operates in public-key mode.
    fn is_pubkey_mode(&self) -> bool;

    /// Start a staged C2 keypair rotation.
    ///
    /// At most one rotation may be open at a time; a second request fails
    /// with [`CryptoError::RotationInProgress`]. Symmetric keys fail with
    /// [`CryptoError::InvalidCryptoMode`].
    fn new_c2_key_rotation_tx(&self) -> Result<Box<dyn C2KeyRotationTx>, CryptoError>;
}

/// A staged C2 keypair rotation.
///
/// The new keypair is generated when the transaction opens but the old one
/// stays authoritative for [`E4Key::protect_command`] until `commit`.
pub trait C2KeyRotationTx: Send {
    /// The public half of the pending keypair.
    fn new_public_key(&self) -> Vec<u8>;

    /// Make the pending keypair authoritative.
    fn commit(self: Box<Self>) -> Result<(), CryptoError>;

    /// Discard the pending keypair; the old one remains authoritative.
    fn rollback(self: Box<Self>) -> Result<(), CryptoError>;
}
