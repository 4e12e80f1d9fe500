//! The crypto collaborator.
//!
//! The sync engine never touches key material. It asks a [`Crypto`]
//! implementation for policy (`must_sign`, `must_encrypt`), for a signature
//! over outgoing PDU headers, and for a yes/no verdict on incoming ones.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::error::{CoreError, Result};
use crate::types::PeerId;

/// Signing policy and verification used by sessions.
pub trait Crypto: Send + Sync {
    /// Incoming PDUs that are not verified are ignored.
    fn must_sign(&self) -> bool;

    /// Incoming PDUs over unencrypted links are ignored.
    fn must_encrypt(&self) -> bool;

    /// Sign outgoing header bytes. `None` means "send unsigned".
    fn sign(&self, data: &[u8]) -> Option<Vec<u8>>;

    /// Verify a signature claimed by `sender` over `data`.
    fn verify(&self, sender: &PeerId, data: &[u8], signature: &[u8]) -> bool;
}

/// Permissive collaborator: nothing is signed, nothing verifies, nothing is
/// required.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCrypto;

impl Crypto for NoCrypto {
    fn must_sign(&self) -> bool {
        false
    }

    fn must_encrypt(&self) -> bool {
        false
    }

    fn sign(&self, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn verify(&self, _sender: &PeerId, _data: &[u8], _signature: &[u8]) -> bool {
        false
    }
}

/// A keypair for signing PDUs.
///
/// This wraps ed25519-dalek's SigningKey.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Hex encoding of the public key, suitable for [`Ed25519Crypto::trust_hex`].
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", &self.public_key_hex()[..16])
    }
}

/// Ed25519 signatures with a keyring of trusted peer keys.
pub struct Ed25519Crypto {
    keypair: Keypair,
    keyring: RwLock<HashMap<PeerId, VerifyingKey>>,
    require_signatures: bool,
    require_encryption: bool,
}

impl Ed25519Crypto {
    /// Sign with `keypair`; verification uses the keyring.
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            keyring: RwLock::new(HashMap::new()),
            require_signatures: false,
            require_encryption: false,
        }
    }

    /// Ignore every incoming PDU that does not verify.
    pub fn require_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    /// Ignore every incoming PDU received over an unencrypted link.
    pub fn require_encryption(mut self, required: bool) -> Self {
        self.require_encryption = required;
        self
    }

    /// Trust `keypair`'s public key for `peer`.
    pub fn trust(&self, peer: PeerId, keypair: &Keypair) {
        if let Ok(mut keyring) = self.keyring.write() {
            keyring.insert(peer, keypair.verifying_key());
        }
    }

    /// Trust a hex encoded public key for `peer`.
    pub fn trust_hex(&self, peer: PeerId, public_key: &str) -> Result<()> {
        let bytes = hex::decode(public_key)
            .map_err(|e| CoreError::InvalidPublicKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidPublicKey("expected 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| CoreError::InvalidPublicKey(e.to_string()))?;
        if let Ok(mut keyring) = self.keyring.write() {
            keyring.insert(peer, key);
        }
        Ok(())
    }
}

impl Crypto for Ed25519Crypto {
    fn must_sign(&self) -> bool {
        self.require_signatures
    }

    fn must_encrypt(&self) -> bool {
        self.require_encryption
    }

    fn sign(&self, data: &[u8]) -> Option<Vec<u8>> {
        Some(self.keypair.signing_key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, sender: &PeerId, data: &[u8], signature: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let Ok(keyring) = self.keyring.read() else {
            return false;
        };
        match keyring.get(sender) {
            Some(key) => key.verify(data, &Signature::from_bytes(&bytes)).is_ok(),
            None => false,
        }
    }
}
