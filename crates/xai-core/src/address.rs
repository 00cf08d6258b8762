//! XAI address format.
//!
//! An address is `prefix || UPPER(hex(SHA256(pubkey)[..20]))` where prefix is
//! `XAI` on mainnet and `TXAI` on testnet, giving a fixed 40-character
//! uppercase hex payload. The `COINBASE` sentinel marks subsidy payouts and
//! is never a spendable owner.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::{ADDRESS_PAYLOAD_HEX_LEN, COINBASE_SENDER};
use crate::error::TransactionError;

/// A wallet address string.
///
/// Stored as the full textual form (prefix + payload). Construction through
/// [`derive`](Address::derive) or [`parse`](Address::parse) guarantees
/// well-formedness; raw construction is reserved for the coinbase sentinel
/// and tests.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// The coinbase sentinel address.
    pub fn coinbase() -> Self {
        Self(COINBASE_SENDER.to_string())
    }

    /// Derive an address from a compressed public key.
    pub fn derive(prefix: &str, pubkey: &[u8]) -> Self {
        let digest = Sha256::digest(pubkey);
        Self::from_payload_bytes(prefix, &digest[..20])
    }

    /// Build an address from a 20-byte payload. Used by derivation and tests.
    pub fn from_payload_bytes(prefix: &str, payload: &[u8]) -> Self {
        Self(format!("{prefix}{}", hex::encode_upper(payload)))
    }

    /// Parse and validate a textual address for the given network prefix.
    pub fn parse(prefix: &str, s: &str) -> Result<Self, TransactionError> {
        if s == COINBASE_SENDER {
            return Ok(Self::coinbase());
        }
        let payload = s
            .strip_prefix(prefix)
            .ok_or_else(|| TransactionError::InvalidAddress(s.to_string()))?;
        if payload.len() != ADDRESS_PAYLOAD_HEX_LEN
            || !payload.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        {
            return Err(TransactionError::InvalidAddress(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Whether this address is well-formed for the given network prefix.
    ///
    /// The coinbase sentinel is not a valid recipient.
    pub fn is_valid(&self, prefix: &str) -> bool {
        !self.is_coinbase() && Self::parse(prefix, &self.0).is_ok()
    }

    pub fn is_coinbase(&self) -> bool {
        self.0 == COINBASE_SENDER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
