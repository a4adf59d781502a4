//! Service error taxonomy.
//!
//! Collaborator errors are surfaced without translation to generic codes;
//! the conversions below only lift kind-equivalent variants (a store
//! `NotFound` is the service's `NotFound`) and wrap the rest.

use castellan_commands::CommandError;
use castellan_crypto::CryptoError;
use castellan_pubsub::PubSubError;
use castellan_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the E4 service.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported by the current crypto mode")]
    InvalidCryptoMode,

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("a C2 key rotation is already in progress")]
    RotationInProgress,

    #[error("transport error: {0}")]
    Transport(PubSubError),

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Error::NotFound,
            StoreError::SelfLink | StoreError::InvalidBounds { .. } => {
                Error::InvalidArgument(err.to_string())
            }
            other => Error::Storage(other),
        }
    }
}

impl From<PubSubError> for Error {
    fn from(err: PubSubError) -> Self {
        match err {
            PubSubError::AlreadyConnected => Error::AlreadyConnected,
            PubSubError::NotConnected => Error::NotConnected,
            PubSubError::InvalidTopic(_) => Error::InvalidArgument(err.to_string()),
            other => Error::Transport(other),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidCryptoMode => Error::InvalidCryptoMode,
            CryptoError::RotationInProgress => Error::RotationInProgress,
            CryptoError::InvalidKeyLen { .. }
            | CryptoError::InvalidKey
            | CryptoError::InvalidName(_)
            | CryptoError::InvalidIdLen { .. } => Error::InvalidArgument(err.to_string()),
            other => Error::Crypto(other),
        }
    }
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}
