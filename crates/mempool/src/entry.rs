//! A single resident mempool transaction with its cached admission data.

use std::sync::Arc;

use emberd_consensus::feerate::FeeRate;
use emberd_consensus::Amount;
use emberd_primitives::transaction::{Transaction, TxId};

use crate::dsproof::DspId;

#[derive(Clone, Debug)]
pub struct TxMempoolEntry {
    tx: Arc<Transaction>,
    txid: TxId,
    fee: Amount,
    size: usize,
    /// Acceptance time, unix seconds.
    time: i64,
    entry_height: i32,
    spends_coinbase: bool,
    sig_checks: i64,
    /// Delta applied by prioritise_transaction; persists across dump/load.
    fee_delta: Amount,
    /// Assigned by the pool at insertion, strictly increasing.
    entry_id: u64,
    dsp_id: Option<DspId>,
}

impl TxMempoolEntry {
    pub fn new(
        tx: Arc<Transaction>,
        fee: Amount,
        time: i64,
        entry_height: i32,
        spends_coinbase: bool,
        sig_checks: i64,
    ) -> Self {
        let txid = tx.txid();
        let size = tx.total_size();
        Self {
            tx,
            txid,
            fee,
            size,
            time,
            entry_height,
            spends_coinbase,
            sig_checks,
            fee_delta: 0,
            entry_id: 0,
            dsp_id: None,
        }
    }

    pub fn txid(&self) -> &TxId {
        &self.txid
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn shared_tx(&self) -> Arc<Transaction> {
        Arc::clone(&self.tx)
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    /// Fee as adjusted by any prioritisation delta.
    pub fn modified_fee(&self) -> Amount {
        self.fee.saturating_add(self.fee_delta)
    }

    pub fn fee_delta(&self) -> Amount {
        self.fee_delta
    }

    pub(crate) fn set_fee_delta(&mut self, delta: Amount) {
        self.fee_delta = delta;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn entry_height(&self) -> i32 {
        self.entry_height
    }

    pub fn spends_coinbase(&self) -> bool {
        self.spends_coinbase
    }

    pub fn sig_checks(&self) -> i64 {
        self.sig_checks
    }

    pub fn entry_id(&self) -> u64 {
        self.entry_id
    }

    pub(crate) fn set_entry_id(&mut self, id: u64) {
        self.entry_id = id;
    }

    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_fee_and_size(self.fee, self.size)
    }

    pub fn modified_fee_rate(&self) -> FeeRate {
        FeeRate::from_fee_and_size(self.modified_fee(), self.size)
    }

    pub fn has_dsp(&self) -> bool {
        self.dsp_id.is_some()
    }

    pub fn dsp_id(&self) -> Option<&DspId> {
        self.dsp_id.as_ref()
    }

    pub(crate) fn set_dsp_id(&mut self, id: DspId) {
        self.dsp_id = Some(id);
    }
}
