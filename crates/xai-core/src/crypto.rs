//! secp256k1 ECDSA operations for the XAI protocol.
//!
//! Provides key generation, transaction and header signing, and signature
//! verification. Signatures are 64-byte compact ECDSA over the SHA-256
//! identity hash (txid for transactions, header hash for blocks), so the
//! signed message already commits to every field except the signature.
//!
//! Low-S enforcement: signing always produces normalized signatures and
//! verification rejects high-S encodings, so a third party cannot malleate
//! a signature into a second valid form.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, SecretKey, SECP256K1};
use std::fmt;

use crate::address::Address;
use crate::error::CryptoError;
use crate::types::{BlockHeader, Hash256, Transaction};

/// Compressed public key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 33;
/// Compact ECDSA signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// A secp256k1 keypair for signing transactions and block headers.
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let (secret, _) = SECP256K1.generate_keypair(&mut secp256k1::rand::thread_rng());
        Self { secret }
    }

    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { secret })
    }

    /// The raw secret key bytes. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    /// Derive the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.secret.public_key(SECP256K1),
        }
    }

    /// Derive the wallet address for the given network prefix.
    pub fn address(&self, prefix: &str) -> Address {
        self.public_key().address(prefix)
    }

    /// Sign a 32-byte message hash, returning the compact signature.
    pub fn sign(&self, msg_hash: &Hash256) -> [u8; SIGNATURE_LEN] {
        let msg = Message::from_digest_slice(msg_hash.as_bytes())
            .expect("hash is exactly 32 bytes");
        SECP256K1.sign_ecdsa(&msg, &self.secret).serialize_compact()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self { secret: self.secret }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// A compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: secp256k1::PublicKey,
}

impl PublicKey {
    /// Parse from compressed bytes (exactly 33 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidPublicKey);
        }
        let inner =
            secp256k1::PublicKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Compressed serialization (33 bytes).
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.inner.serialize()
    }

    /// Derive the wallet address for the given network prefix.
    pub fn address(&self, prefix: &str) -> Address {
        Address::derive(prefix, &self.to_bytes())
    }

    /// Verify a compact signature over a 32-byte message hash.
    ///
    /// Rejects signatures that are not exactly [`SIGNATURE_LEN`] bytes or
    /// that use the non-canonical high-S encoding.
    pub fn verify(&self, msg_hash: &Hash256, signature: &[u8]) -> Result<(), CryptoError> {
        let sig_bytes: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let sig = Signature::from_compact(&sig_bytes).map_err(|_| CryptoError::InvalidSignature)?;
        let msg = Message::from_digest_slice(msg_hash.as_bytes())
            .expect("hash is exactly 32 bytes");
        SECP256K1
            .verify_ecdsa(&msg, &sig, &self.inner)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// Sign a transaction in place: sets `public_key` and `signature`.
///
/// The signature covers the txid, which commits to every other field, so the
/// transaction must not be modified afterwards.
pub fn sign_transaction(tx: &mut Transaction, keypair: &KeyPair) {
    tx.public_key = keypair.public_key().to_bytes().to_vec();
    let txid = tx.txid();
    tx.signature = Some(keypair.sign(&txid).to_vec());
}

/// Verify a transaction's signature against its declared public key.
pub fn verify_transaction_signature(tx: &Transaction) -> Result<(), CryptoError> {
    let signature = tx.signature.as_deref().ok_or(CryptoError::InvalidSignature)?;
    let pk = PublicKey::from_bytes(&tx.public_key)?;
    pk.verify(&tx.txid(), signature)
}

/// Sign a block header in place: sets `miner_pubkey` and `signature`.
pub fn sign_block_header(header: &mut BlockHeader, keypair: &KeyPair) {
    header.miner_pubkey = Some(keypair.public_key().to_bytes().to_vec());
    let hash = header.hash();
    header.signature = Some(keypair.sign(&hash).to_vec());
}

/// Verify a block header's miner signature, if present.
///
/// An unsigned header passes; a signature without a miner pubkey (or vice
/// versa) fails.
pub fn verify_header_signature(header: &BlockHeader) -> Result<(), CryptoError> {
    match (&header.miner_pubkey, &header.signature) {
        (None, None) => Ok(()),
        (Some(pk_bytes), Some(sig)) => {
            let pk = PublicKey::from_bytes(pk_bytes)?;
            pk.verify(&header.hash(), sig)
        }
        _ => Err(CryptoError::InvalidSignature),
    }
}
