//! Public-key-mode E4 key: Ed25519 client identities, a rotatable C2
//! keypair, signed-then-encrypted command protection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{e4, C2KeyRotationTx, CryptoError, E4Key, GeneratedKey};

const COMMAND_INFO: &[u8] = b"castellan.command.v1";

/// Public-key E4 key material.
///
/// The C2 holds an Ed25519 keypair; each client holds its own Ed25519
/// keypair and the C2 stores only the public half. Commands are signed with
/// the C2 signing key, then encrypted under a key agreed with the recipient
/// (X25519 over the converted keys).
pub struct PubKeyE4Key {
    inner: Arc<Inner>,
}

struct Inner {
    signing_key: parking_lot::RwLock<SigningKey>,
    rotation_open: AtomicBool,
}

impl PubKeyE4Key {
    /// Build from an existing 32-byte Ed25519 seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }

    /// Generate a fresh C2 keypair.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    fn new(signing_key: SigningKey) -> Self {
        Self {
            inner: Arc::new(Inner {
                signing_key: parking_lot::RwLock::new(signing_key),
                rotation_open: AtomicBool::new(false),
            }),
        }
    }

    /// The current C2 public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.signing_key.read().verifying_key().to_bytes()
    }

    /// The current C2 seed, for persisting across restarts.
    pub fn seed(&self) -> [u8; 32] {
        self.inner.signing_key.read().to_bytes()
    }
}

impl E4Key for PubKeyE4Key {
    fn validate_key(&self, key: &[u8]) -> Result<(), CryptoError> {
        let bytes: [u8; 32] = key.try_into().map_err(|_| CryptoError::InvalidKeyLen {
            got: key.len(),
            want: e4::KEY_LEN,
        })?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(())
    }

    fn random_key(&self) -> Result<GeneratedKey, CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        Ok(GeneratedKey {
            wire: signing_key.to_bytes().to_vec(),
            stored: signing_key.verifying_key().to_bytes().to_vec(),
        })
    }

    fn protect_command(&self, command: &[u8], client_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.validate_key(client_key)?;
        let client_pub: [u8; 32] = client_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey)?;

        let signing_key = self.signing_key();
        let signature = signing_key.sign(command);

        let shared = shared_key(&signing_key.to_bytes(), &client_pub)?;

        let mut signed = Vec::with_capacity(command.len() + signature.to_bytes().len());
        signed.extend_from_slice(command);
        signed.extend_from_slice(&signature.to_bytes());

        e4::encrypt(&shared, &signed)
    }

    fn is_pubkey_mode(&self) -> bool {
        true
    }

    fn new_c2_key_rotation_tx(&self) -> Result<Box<dyn C2KeyRotationTx>, CryptoError> {
        if self.inner.rotation_open.swap(true, Ordering::SeqCst) {
            return Err(CryptoError::RotationInProgress);
        }
        Ok(Box::new(C2KeyRotation {
            inner: Arc::clone(&self.inner),
            pending: SigningKey::generate(&mut OsRng),
            open: true,
        }))
    }
}

impl PubKeyE4Key {
    fn signing_key(&self) -> SigningKey {
        self.inner.signing_key.read().clone()
    }
}

/// A pending C2 keypair, held until commit or rollback.
struct C2KeyRotation {
    inner: Arc<Inner>,
    pending: SigningKey,
    open: bool,
}

impl C2KeyRotationTx for C2KeyRotation {
    fn new_public_key(&self) -> Vec<u8> {
        self.pending.verifying_key().to_bytes().to_vec()
    }

    fn commit(mut self: Box<Self>) -> Result<(), CryptoError> {
        *self.inner.signing_key.write() = self.pending.clone();
        self.open = false;
        self.inner.rotation_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), CryptoError> {
        self.open = false;
        self.inner.rotation_open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for C2KeyRotation {
    fn drop(&mut self) {
        // An abandoned rotation releases the single-holder guard.
        if self.open {
            self.inner.rotation_open.store(false, Ordering::SeqCst);
        }
    }
}

/// Agree on a symmetric command key between the C2 and a client.
///
/// Both Ed25519 halves are converted to X25519 (RFC 7748 §5) and the DH
/// output is expanded with HKDF-SHA256.
pub fn shared_key(c2_seed: &[u8; 32], client_pub: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let secret = ed25519_seed_to_x25519(c2_seed);
    let public = ed25519_pubkey_to_x25519(client_pub)?;
    let dh = secret.diffie_hellman(&public);

    let hk = Hkdf::<Sha256>::new(None, dh.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(COMMAND_INFO, &mut key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(key)
}

/// Convert a 32-byte Ed25519 seed to an X25519 static secret.
fn ed25519_seed_to_x25519(seed: &[u8; 32]) -> StaticSecret {
    let hash = Sha512::digest(seed);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    StaticSecret::from(key)
}

/// Convert a compressed Ed25519 public key to X25519 Montgomery form.
fn ed25519_pubkey_to_x25519(pubkey: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    let point = CompressedEdwardsY(*pubkey)
        .decompress()
        .ok_or(CryptoError::InvalidKey)?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    fn client_keypair() -> (SigningKey, [u8; 32]) {
        let sk = SigningKey::generate(&mut OsRng);
        let public = sk.verifying_key().to_bytes();
        (sk, public)
    }

    /// Decrypt and verify a protected command the way a client would.
    fn unprotect(payload: &[u8], client_sk: &SigningKey, c2_pub: &[u8; 32]) -> Vec<u8> {
        let key = shared_key(&client_sk.to_bytes(), c2_pub).unwrap();
        let signed = e4::decrypt(&key, payload).unwrap();

        let (command, sig_bytes) = signed.split_at(signed.len() - 64);
        let signature = Signature::from_bytes(sig_bytes.try_into().unwrap());
        let c2_vk = VerifyingKey::from_bytes(c2_pub).unwrap();
        c2_vk.verify(command, &signature).unwrap();

        command.to_vec()
    }

    #[test]
    fn shared_key_agrees_both_ways() {
        let c2 = SigningKey::generate(&mut OsRng);
        let (client_sk, client_pub) = client_keypair();

        let from_c2 = shared_key(&c2.to_bytes(), &client_pub).unwrap();
        let from_client = shared_key(&client_sk.to_bytes(), &c2.verifying_key().to_bytes()).unwrap();
        assert_eq!(from_c2, from_client);
    }

    #[test]
    fn random_key_is_a_keypair() {
        let key = PubKeyE4Key::generate();
        let generated = key.random_key().unwrap();

        let sk = SigningKey::from_bytes(&generated.wire.clone().try_into().unwrap());
        assert_eq!(sk.verifying_key().to_bytes().to_vec(), generated.stored);
        assert!(key.validate_key(&generated.stored).is_ok());
    }

    #[test]
    fn validate_key_rejects_garbage() {
        let key = PubKeyE4Key::generate();
        assert!(key.validate_key(&[1u8; 16]).is_err());
    }

    #[test]
    fn protect_command_round_trips_and_verifies() {
        let c2 = PubKeyE4Key::generate();
        let (client_sk, client_pub) = client_keypair();

        let command = vec![0x03, 0xaa, 0xbb];
        let payload = c2.protect_command(&command, &client_pub).unwrap();

        let recovered = unprotect(&payload, &client_sk, &c2.public_key());
        assert_eq!(recovered, command);
    }

    #[test]
    fn protect_command_is_deterministic() {
        let c2 = PubKeyE4Key::generate();
        let (_, client_pub) = client_keypair();

        let a = c2.protect_command(b"cmd", &client_pub).unwrap();
        let b = c2.protect_command(b"cmd", &client_pub).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rotation_commits_the_new_key() {
        let c2 = PubKeyE4Key::generate();
        let old_pub = c2.public_key();

        let tx = c2.new_c2_key_rotation_tx().unwrap();
        let new_pub: [u8; 32] = tx.new_public_key().try_into().unwrap();
        assert_ne!(new_pub, old_pub);

        // Old key authoritative until commit.
        assert_eq!(c2.public_key(), old_pub);

        tx.commit().unwrap();
        assert_eq!(c2.public_key(), new_pub);
    }

    #[test]
    fn rotation_rollback_keeps_the_old_key() {
        let c2 = PubKeyE4Key::generate();
        let old_pub = c2.public_key();

        let tx = c2.new_c2_key_rotation_tx().unwrap();
        tx.rollback().unwrap();
        assert_eq!(c2.public_key(), old_pub);
    }

    #[test]
    fn only_one_rotation_may_be_open() {
        let c2 = PubKeyE4Key::generate();

        let tx = c2.new_c2_key_rotation_tx().unwrap();
        assert!(matches!(
            c2.new_c2_key_rotation_tx().map(|_| ()),
            Err(CryptoError::RotationInProgress)
        ));

        tx.rollback().unwrap();
        c2.new_c2_key_rotation_tx().unwrap().commit().unwrap();
    }

    #[test]
    fn dropping_an_open_rotation_releases_the_guard() {
        let c2 = PubKeyE4Key::generate();
        drop(c2.new_c2_key_rotation_tx().unwrap());
        assert!(c2.new_c2_key_rotation_tx().is_ok());
    }
}
