//! Transaction validation.
//!
//! Three layers, each building on the previous:
//!
//! - **Structural** ([`validate_transaction_structure`]): context-free shape
//!   checks. No chain state, no cryptography.
//! - **Authorship** ([`verify_sender`]): signature verification and
//!   sender/key binding.
//! - **Contextual** ([`validate_transaction`]): UTXO ownership, coinbase
//!   maturity, value conservation, and nonce sequencing against live state.
//!
//! Coinbase transactions stop at the structural layer here; their reward
//! equality is a block-level rule checked in
//! [`block_validation`](crate::block_validation).

use std::collections::HashSet;

use crate::config::Config;
use crate::constants::MAX_TX_SIZE;
use crate::crypto::{self, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::error::TransactionError;
use crate::types::{OutPoint, Transaction, TxType, UtxoEntry};

/// Summary of a successfully validated transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransaction {
    /// Total value of all spent inputs.
    pub total_input: u64,
    /// Total value of all created outputs.
    pub total_output: u64,
    /// Fee in base units.
    pub fee: u64,
    /// Serialized size in bytes.
    pub size: usize,
}

/// Context-free shape checks.
///
/// Applies to every transaction kind:
/// - Valid, non-empty sender and recipient for the configured network
/// - Non-empty outputs with non-zero values, no value overflow
/// - Serialized size within [`MAX_TX_SIZE`]
///
/// Kind-specific:
/// - Coinbase/faucet: sentinel sender, no inputs, empty key material;
///   faucet additionally requires the exact configured faucet amount and an
///   enabled faucet (testnet only)
/// - Everything else: non-empty deduplicated inputs, correctly sized public
///   key and signature, positive amount for plain transfers
pub fn validate_transaction_structure(
    tx: &Transaction,
    config: &Config,
) -> Result<(), TransactionError> {
    let prefix = config.network.address_prefix();

    if !tx.recipient.is_valid(prefix) {
        return Err(TransactionError::InvalidAddress(tx.recipient.to_string()));
    }

    if tx.outputs.is_empty() {
        return Err(TransactionError::EmptyOutputs);
    }
    for output in &tx.outputs {
        if output.amount == 0 {
            return Err(TransactionError::InvalidAmount);
        }
        if !output.address.is_valid(prefix) {
            return Err(TransactionError::InvalidAddress(output.address.to_string()));
        }
    }
    let total_output = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
    tx.amount
        .checked_add(tx.fee)
        .ok_or(TransactionError::ValueOverflow)?;

    let size = tx.size()?;
    if size > MAX_TX_SIZE {
        return Err(TransactionError::OversizedTransaction { size, max: MAX_TX_SIZE });
    }

    match &tx.tx_type {
        TxType::Coinbase | TxType::Faucet => {
            if !tx.sender.is_coinbase() {
                return Err(TransactionError::InvalidCoinbase(
                    "mint sender must be the coinbase sentinel".into(),
                ));
            }
            if !tx.inputs.is_empty() {
                return Err(TransactionError::InvalidCoinbase("mint must have no inputs".into()));
            }
            if !tx.public_key.is_empty() || tx.signature.is_some() {
                return Err(TransactionError::InvalidCoinbase(
                    "mint carries no key material".into(),
                ));
            }
            if tx.tx_type == TxType::Faucet {
                if !config.faucet_enabled() {
                    return Err(TransactionError::FaucetDisabled);
                }
                if tx.amount != config.faucet_amount || total_output != config.faucet_amount {
                    return Err(TransactionError::InvalidAmount);
                }
            }
        }
        TxType::Transfer | TxType::Governance { .. } | TxType::ContractCall { .. } => {
            if tx.sender.is_coinbase() || !tx.sender.is_valid(prefix) {
                return Err(TransactionError::InvalidAddress(tx.sender.to_string()));
            }
            if tx.tx_type == TxType::Transfer && tx.amount == 0 {
                return Err(TransactionError::InvalidAmount);
            }
            if tx.inputs.is_empty() {
                return Err(TransactionError::InsufficientInputs { have: 0, need: tx.amount });
            }
            let mut seen = HashSet::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                if !seen.insert(input) {
                    return Err(TransactionError::DuplicateInput(input.to_string()));
                }
            }
            if tx.public_key.len() != PUBLIC_KEY_LEN {
                return Err(TransactionError::InvalidSignature);
            }
            match &tx.signature {
                None => return Err(TransactionError::MissingSignature),
                Some(sig) if sig.len() != SIGNATURE_LEN => {
                    return Err(TransactionError::InvalidSignature)
                }
                Some(_) => {}
            }
        }
    }

    Ok(())
}

/// Verify the signature and bind the signing key to the sender address.
///
/// The address derived from the declared public key must equal `sender`, and
/// the compact ECDSA signature must verify over the txid. Coinbase and
/// faucet mints are exempt.
pub fn verify_sender(tx: &Transaction, config: &Config) -> Result<(), TransactionError> {
    if !tx.requires_signature() {
        return Ok(());
    }
    let pk = crypto::PublicKey::from_bytes(&tx.public_key)
        .map_err(|_| TransactionError::InvalidSignature)?;
    let derived = pk.address(config.network.address_prefix());
    if derived != tx.sender {
        return Err(TransactionError::SenderMismatch(derived.to_string()));
    }
    crypto::verify_transaction_signature(tx).map_err(|e| match e {
        crate::error::CryptoError::InvalidSignature if tx.signature.is_none() => {
            TransactionError::MissingSignature
        }
        _ => TransactionError::InvalidSignature,
    })
}

/// Full contextual validation against live UTXO and nonce state.
///
/// On top of structure and authorship:
/// - Every input references an unspent UTXO owned by the sender
/// - Coinbase-created inputs have `coinbase_maturity` confirmations
/// - `sum(inputs) >= amount + fee` and `sum(outputs) == sum(inputs) - fee`
/// - Outputs pay the recipient at least `amount`
/// - If `expected_nonce` is given, the nonce must match it exactly
///
/// Coinbase transactions are rejected: their value rule depends on block
/// fees and is enforced by block validation.
pub fn validate_transaction<F>(
    tx: &Transaction,
    config: &Config,
    get_utxo: F,
    current_height: u64,
    expected_nonce: Option<u64>,
) -> Result<ValidatedTransaction, TransactionError>
where
    F: Fn(&OutPoint) -> Option<UtxoEntry>,
{
    if tx.is_coinbase() {
        return Err(TransactionError::InvalidCoinbase(
            "coinbase is validated at the block level".into(),
        ));
    }

    validate_transaction_structure(tx, config)?;
    verify_sender(tx, config)?;

    let size = tx.size()?;
    let total_output = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;

    // Faucet mints create value from nothing; conservation rules do not apply.
    if tx.is_faucet() {
        return Ok(ValidatedTransaction { total_input: 0, total_output, fee: 0, size });
    }

    let mut total_input = 0u64;
    for (i, input) in tx.inputs.iter().enumerate() {
        let utxo = get_utxo(input)
            .ok_or_else(|| TransactionError::UnknownUtxo(input.to_string()))?;
        if utxo.address != tx.sender {
            return Err(TransactionError::InputNotOwned(i));
        }
        if !utxo.is_mature(current_height, config.coinbase_maturity) {
            return Err(TransactionError::ImmatureCoinbase { index: i });
        }
        total_input = total_input
            .checked_add(utxo.amount)
            .ok_or(TransactionError::ValueOverflow)?;
    }

    let need = tx.amount + tx.fee; // overflow checked structurally
    if total_input < need {
        return Err(TransactionError::InsufficientInputs { have: total_input, need });
    }

    let expected_output = total_input - tx.fee;
    if total_output != expected_output {
        return Err(TransactionError::OutputMismatch {
            expected: expected_output,
            got: total_output,
        });
    }

    let recipient_paid: u64 = tx
        .outputs
        .iter()
        .filter(|o| o.address == tx.recipient)
        .fold(0u64, |acc, o| acc.saturating_add(o.amount));
    if recipient_paid < tx.amount {
        return Err(TransactionError::OutputMismatch {
            expected: tx.amount,
            got: recipient_paid,
        });
    }

    if let Some(expected) = expected_nonce {
        if tx.nonce != expected {
            return Err(TransactionError::NonceMismatch {
                sender: tx.sender.to_string(),
                expected,
                got: tx.nonce,
            });
        }
    }

    Ok(ValidatedTransaction { total_input, total_output, fee: tx.fee, size })
}
