//! Outbound interfaces consumed by external collaborators.
//!
//! The core never initiates I/O of its own: transport, monitoring, and
//! slashing integrations register these sinks at node construction and the
//! facade calls into them at the relevant points. All methods default to
//! no-ops so embedders implement only what they need.

use crate::address::Address;
use crate::error::RejectReason;
use crate::types::{Block, BlockHeader, Hash256};

/// Chain lifecycle events emitted to the transport / observer layer.
pub trait EventListener: Send + Sync {
    fn block_mined(&self, _block: &Block) {}
    fn block_finalized(&self, _height: u64, _hash: &Hash256) {}
    fn mempool_rejected(&self, _txid: &Hash256, _reason: &RejectReason) {}
    fn reorg_committed(&self, _old_tip: Hash256, _new_tip: Hash256, _fork_height: u64) {}
}

/// Counters incremented on admission, rejection, eviction, and reorg.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TelemetryCounter {
    TxAdmitted,
    TxRejectedInvalid,
    TxRejectedBanned,
    TxRejectedLowFee,
    TxRejectedSenderCap,
    TxEvictedLowFee,
    TxExpired,
    BlockConnected,
    BlockRejected,
    BlockOrphaned,
    ReorgCommitted,
    ReorgRolledBack,
    SenderBanned,
}

/// Monotonic counter sink for monitoring integrations.
pub trait TelemetrySink: Send + Sync {
    fn incr(&self, _counter: TelemetryCounter) {}
}

/// Double-vote evidence forwarded to an external slashing processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlashingEvidence {
    pub validator: Address,
    pub height: u64,
    /// The two conflicting headers the validator voted for.
    pub evidence: [BlockHeader; 2],
}

/// Receiver for validator misbehavior evidence.
pub trait SlashingSink: Send + Sync {
    fn report(&self, _evidence: SlashingEvidence) {}
}

/// No-op listener for nodes without a transport layer.
pub struct NullListener;
impl EventListener for NullListener {}

/// No-op telemetry sink.
pub struct NullTelemetry;
impl TelemetrySink for NullTelemetry {}

/// No-op slashing sink.
pub struct NullSlashing;
impl SlashingSink for NullSlashing {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct CountingTelemetry {
        counts: Mutex<HashMap<TelemetryCounter, u64>>,
    }

    impl TelemetrySink for CountingTelemetry {
        fn incr(&self, counter: TelemetryCounter) {
            *self.counts.lock().unwrap().entry(counter).or_insert(0) += 1;
        }
    }

    struct RecordingSlashing {
        reports: Mutex<Vec<SlashingEvidence>>,
    }

    impl SlashingSink for RecordingSlashing {
        fn report(&self, evidence: SlashingEvidence) {
            self.reports.lock().unwrap().push(evidence);
        }
    }

    fn header(nonce: u64) -> BlockHeader {
        BlockHeader {
            index: 5,
            previous_hash: Hash256([1; 32]),
            merkle_root: Hash256([2; 32]),
            timestamp: 1_700_000_000,
            difficulty: 1,
            nonce,
            version: 1,
            miner_pubkey: None,
            signature: None,
        }
    }

    #[test]
    fn null_impls_are_usable_as_dyn() {
        let listener: &dyn EventListener = &NullListener;
        listener.block_finalized(1, &Hash256::ZERO);
        let telemetry: &dyn TelemetrySink = &NullTelemetry;
        telemetry.incr(TelemetryCounter::TxAdmitted);
        let slashing: &dyn SlashingSink = &NullSlashing;
        slashing.report(SlashingEvidence {
            validator: Address::coinbase(),
            height: 0,
            evidence: [header(0), header(1)],
        });
    }

    #[test]
    fn counting_sink_accumulates() {
        let sink = CountingTelemetry { counts: Mutex::new(HashMap::new()) };
        sink.incr(TelemetryCounter::TxAdmitted);
        sink.incr(TelemetryCounter::TxAdmitted);
        sink.incr(TelemetryCounter::BlockConnected);
        let counts = sink.counts.lock().unwrap();
        assert_eq!(counts[&TelemetryCounter::TxAdmitted], 2);
        assert_eq!(counts[&TelemetryCounter::BlockConnected], 1);
    }

    #[test]
    fn slashing_report_round_trips_evidence() {
        let sink = RecordingSlashing { reports: Mutex::new(Vec::new()) };
        let evidence = SlashingEvidence {
            validator: Address::from_payload_bytes("XAI", &[7; 20]),
            height: 5,
            evidence: [header(0), header(1)],
        };
        sink.report(evidence.clone());
        assert_eq!(sink.reports.lock().unwrap().as_slice(), &[evidence]);
    }
}
