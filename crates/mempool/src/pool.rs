//! The transaction pool: one source of truth (`map_tx`) plus consistent
//! auxiliary views by entry id and by spent outpoint, and a parent/child
//! linkage side-table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use emberd_consensus::constants::{
    DSPROOF_RECURSION_LIMIT, MEMPOOL_FULL_FEE_INCREMENT, ROLLING_FEE_HALFLIFE,
};
use emberd_consensus::feerate::{compare_fee_rates, FeeRate};
use emberd_consensus::Amount;
use emberd_primitives::coin::CoinView;
use emberd_primitives::hash::hash256_to_hex;
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::{Transaction, TxId};

use crate::dsproof::{DoubleSpendProof, DoubleSpendProofStorage, DspId};
use crate::entry::TxMempoolEntry;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemovalReason {
    Expiry,
    SizeLimit,
    Reorg,
    Block,
    Conflict,
    Replaced,
    Manual,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemovalReason::Expiry => "expiry",
            RemovalReason::SizeLimit => "size limit",
            RemovalReason::Reorg => "reorg",
            RemovalReason::Block => "block",
            RemovalReason::Conflict => "conflict",
            RemovalReason::Replaced => "replaced",
            RemovalReason::Manual => "manual",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    TooManyAncestors,
    AncestorSizeLimit,
}

/// Admission failure with a reason suitable for reject messages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
}

impl MempoolError {
    fn new(kind: MempoolErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl fmt::Display for MempoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

/// Admission limits for the ancestor walk.
#[derive(Clone, Copy, Debug)]
pub struct AncestorLimits {
    pub max_ancestor_count: usize,
    pub max_ancestor_size: usize,
}

impl Default for AncestorLimits {
    fn default() -> Self {
        Self {
            max_ancestor_count: 50,
            max_ancestor_size: 101_000,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DspSearchError {
    /// The ancestor walk exceeded the recursion ceiling.
    RecursionLimitReached,
}

impl fmt::Display for DspSearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DspSearchError::RecursionLimitReached => {
                write!(f, "mempool depth limit exceeded ({DSPROOF_RECURSION_LIMIT})")
            }
        }
    }
}

impl std::error::Error for DspSearchError {}

/// Read-side summary of one entry, for RPC-style consumers.
#[derive(Clone, Debug)]
pub struct TxMempoolInfo {
    pub tx: Arc<Transaction>,
    pub time: i64,
    pub fee_rate: FeeRate,
    pub fee_delta: Amount,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct TxLinks {
    parents: BTreeSet<TxId>,
    children: BTreeSet<TxId>,
}

/// One level of the iterative proof search.
struct Frame {
    parents: Vec<TxId>,
    next: usize,
}

/// Estimated bookkeeping bytes per resident entry beyond its serialized
/// transaction (indices, links, allocator overhead).
const ENTRY_OVERHEAD: usize = 256;
const INDEX_ITEM_OVERHEAD: usize = 64;

pub struct Mempool {
    map_tx: HashMap<TxId, TxMempoolEntry>,
    by_entry_id: BTreeMap<u64, TxId>,
    map_links: HashMap<TxId, TxLinks>,
    /// Spent outpoint -> the resident transaction spending it.
    map_next_tx: BTreeMap<OutPoint, TxId>,
    /// Prioritisation deltas, kept even for transactions not yet seen.
    map_deltas: HashMap<TxId, Amount>,
    next_entry_id: u64,
    total_tx_size: u64,
    /// Sat/kB floor raised by evictions, decaying while no block arrives.
    rolling_minimum_fee_rate: f64,
    last_rolling_fee_update: i64,
    block_since_last_rolling_fee_bump: bool,
    dsp_storage: DoubleSpendProofStorage,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self {
            map_tx: HashMap::new(),
            by_entry_id: BTreeMap::new(),
            map_links: HashMap::new(),
            map_next_tx: BTreeMap::new(),
            map_deltas: HashMap::new(),
            next_entry_id: 0,
            total_tx_size: 0,
            rolling_minimum_fee_rate: 0.0,
            last_rolling_fee_update: now_secs(),
            block_since_last_rolling_fee_bump: false,
            dsp_storage: DoubleSpendProofStorage::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.map_tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map_tx.is_empty()
    }

    pub fn total_tx_size(&self) -> u64 {
        self.total_tx_size
    }

    /// Estimated memory footprint used by the size limiter. An estimate,
    /// not an exact count; stable for a given pool content.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.total_tx_size as usize
            + self.map_tx.len() * ENTRY_OVERHEAD
            + (self.map_next_tx.len() + self.map_deltas.len()) * INDEX_ITEM_OVERHEAD
    }

    pub fn exists(&self, txid: &TxId) -> bool {
        self.map_tx.contains_key(txid)
    }

    pub fn get(&self, txid: &TxId) -> Option<&TxMempoolEntry> {
        self.map_tx.get(txid)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.map_next_tx.contains_key(outpoint)
    }

    /// The resident transaction spending `outpoint`, if any.
    pub fn get_conflict_tx(&self, outpoint: &OutPoint) -> Option<&TxId> {
        self.map_next_tx.get(outpoint)
    }

    pub fn parents_of(&self, txid: &TxId) -> Option<&BTreeSet<TxId>> {
        self.map_links.get(txid).map(|links| &links.parents)
    }

    pub fn children_of(&self, txid: &TxId) -> Option<&BTreeSet<TxId>> {
        self.map_links.get(txid).map(|links| &links.children)
    }

    /// Txids in insertion (topological) order.
    pub fn txids_by_entry_order(&self) -> Vec<TxId> {
        self.by_entry_id.values().cloned().collect()
    }

    pub fn entries_by_entry_order(&self) -> impl Iterator<Item = &TxMempoolEntry> {
        self.by_entry_id
            .values()
            .map(|txid| self.map_tx.get(txid).expect("index entry resident"))
    }

    /// Collects the full in-mempool ancestor set of a not-yet-inserted
    /// transaction, failing with a reason when an admission limit would be
    /// exceeded. Descendant-side limits are advisory and not enforced here.
    pub fn calculate_ancestors(
        &self,
        tx: &Transaction,
        tx_size: usize,
        limits: &AncestorLimits,
    ) -> Result<BTreeSet<TxId>, MempoolError> {
        let mut stage: BTreeSet<TxId> = tx
            .vin
            .iter()
            .filter(|input| self.map_tx.contains_key(&input.prevout.hash))
            .map(|input| input.prevout.hash)
            .collect();
        if stage.len() + 1 > limits.max_ancestor_count {
            return Err(MempoolError::new(
                MempoolErrorKind::TooManyAncestors,
                format!(
                    "too many unconfirmed parents [limit: {}]",
                    limits.max_ancestor_count
                ),
            ));
        }

        let mut ancestors: BTreeSet<TxId> = BTreeSet::new();
        let mut total_size = tx_size;
        while let Some(next) = stage.pop_first() {
            ancestors.insert(next);
            let entry = self
                .map_tx
                .get(&next)
                .expect("staged ancestor is resident");
            total_size += entry.size();
            if total_size > limits.max_ancestor_size {
                return Err(MempoolError::new(
                    MempoolErrorKind::AncestorSizeLimit,
                    format!(
                        "exceeds ancestor size limit [limit: {}]",
                        limits.max_ancestor_size
                    ),
                ));
            }
            let links = self.map_links.get(&next).expect("resident tx has links");
            for parent in &links.parents {
                if !ancestors.contains(parent) {
                    stage.insert(*parent);
                }
                if stage.len() + ancestors.len() + 1 > limits.max_ancestor_count {
                    return Err(MempoolError::new(
                        MempoolErrorKind::TooManyAncestors,
                        format!(
                            "too many unconfirmed ancestors [limit: {}]",
                            limits.max_ancestor_count
                        ),
                    ));
                }
            }
        }
        Ok(ancestors)
    }

    /// Inserts without validation; the caller has already done admission
    /// checks. Assigns the next entry id and applies any pending
    /// prioritisation delta. Returns the assigned entry id.
    pub fn add_unchecked(&mut self, mut entry: TxMempoolEntry) -> u64 {
        let txid = *entry.txid();
        assert!(
            !self.map_tx.contains_key(&txid),
            "duplicate mempool insertion"
        );

        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;
        entry.set_entry_id(entry_id);

        if let Some(delta) = self.map_deltas.get(&txid) {
            entry.set_fee_delta(*delta);
        }

        let mut parents: BTreeSet<TxId> = BTreeSet::new();
        for input in &entry.tx().vin {
            self.map_next_tx.insert(input.prevout.clone(), txid);
            if self.map_tx.contains_key(&input.prevout.hash) {
                parents.insert(input.prevout.hash);
            }
        }
        for parent in &parents {
            self.map_links
                .get_mut(parent)
                .expect("resident parent has links")
                .children
                .insert(txid);
        }
        // A newly arriving transaction cannot have resident children;
        // such children would have been orphans.
        self.map_links.insert(
            txid,
            TxLinks {
                parents,
                children: BTreeSet::new(),
            },
        );

        self.by_entry_id.insert(entry_id, txid);
        self.total_tx_size += entry.size() as u64;
        emberd_log::log_trace!(
            "mempool accepted {} (entry id {})",
            hash256_to_hex(&txid),
            entry_id
        );
        self.map_tx.insert(txid, entry);
        entry_id
    }

    /// Removes a descendant-closed set. Linkage edges are severed for the
    /// whole batch before any entry is erased, so no entry is removed while
    /// a descendant outside the batch still links to it.
    pub fn remove_staged(&mut self, stage: &BTreeSet<TxId>, reason: RemovalReason) {
        for txid in stage {
            let Some(links) = self.map_links.get(txid).cloned() else {
                continue;
            };
            for parent in &links.parents {
                if let Some(parent_links) = self.map_links.get_mut(parent) {
                    parent_links.children.remove(txid);
                }
            }
            for child in &links.children {
                if let Some(child_links) = self.map_links.get_mut(child) {
                    child_links.parents.remove(txid);
                }
            }
        }
        for txid in stage {
            self.remove_unchecked(txid, reason);
        }
    }

    fn remove_unchecked(&mut self, txid: &TxId, reason: RemovalReason) {
        let Some(entry) = self.map_tx.remove(txid) else {
            return;
        };
        if let Some(dsp_id) = entry.dsp_id() {
            // Keep the proof around as an orphan in case a reorg brings
            // this transaction back.
            self.dsp_storage.orphan_existing(dsp_id, now_secs());
        }
        for input in &entry.tx().vin {
            if self.map_next_tx.get(&input.prevout) == Some(txid) {
                self.map_next_tx.remove(&input.prevout);
            }
        }
        self.map_links.remove(txid);
        self.by_entry_id.remove(&entry.entry_id());
        self.total_tx_size -= entry.size() as u64;
        emberd_log::log_trace!(
            "mempool removed {} ({})",
            hash256_to_hex(txid),
            reason
        );
    }

    /// Adds every in-mempool descendant of `txid` (including itself) to
    /// `descendants`. Entries already present are assumed complete, making
    /// repeated calls idempotent.
    pub fn calculate_descendants(&self, txid: &TxId, descendants: &mut BTreeSet<TxId>) {
        let mut stage: BTreeSet<TxId> = BTreeSet::new();
        if !descendants.contains(txid) && self.map_tx.contains_key(txid) {
            stage.insert(*txid);
        }
        while let Some(next) = stage.pop_first() {
            descendants.insert(next);
            let Some(links) = self.map_links.get(&next) else {
                continue;
            };
            for child in &links.children {
                if !descendants.contains(child) {
                    stage.insert(*child);
                }
            }
        }
    }

    /// Removes a transaction and all of its in-mempool descendants. When
    /// the transaction itself is absent (a reorg may have dropped it), any
    /// resident spenders of its outputs are removed instead.
    pub fn remove_recursive(&mut self, tx: &Transaction, reason: RemovalReason) {
        let txid = tx.txid();
        let mut roots: BTreeSet<TxId> = BTreeSet::new();
        if self.map_tx.contains_key(&txid) {
            roots.insert(txid);
        } else {
            for index in 0..tx.vout.len() as u32 {
                if let Some(spender) = self.map_next_tx.get(&OutPoint::new(txid, index)) {
                    roots.insert(*spender);
                }
            }
        }
        let mut stage: BTreeSet<TxId> = BTreeSet::new();
        for root in &roots {
            self.calculate_descendants(root, &mut stage);
        }
        self.remove_staged(&stage, reason);
    }

    /// Removes resident transactions that conflict with (spend the same
    /// outpoints as) a confirmed transaction.
    fn remove_conflicts(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        for input in &tx.vin {
            let Some(conflicting) = self.map_next_tx.get(&input.prevout) else {
                continue;
            };
            if *conflicting == txid {
                continue;
            }
            let conflict_tx = self
                .map_tx
                .get(conflicting)
                .expect("map_next_tx points at resident tx")
                .shared_tx();
            self.map_deltas.remove(&conflict_tx.txid());
            self.remove_recursive(&conflict_tx, RemovalReason::Conflict);
        }
    }

    /// Called when a block connects. Confirmed transactions leave the pool
    /// exactly (their still-valid descendants stay); unconfirmed spenders
    /// of a confirmed input are removed recursively as conflicts.
    pub fn remove_for_block(&mut self, vtx: &[Arc<Transaction>]) {
        if self.map_tx.is_empty() && self.map_deltas.is_empty() {
            return;
        }
        for tx in vtx {
            let txid = tx.txid();
            if self.map_tx.contains_key(&txid) {
                let mut stage: BTreeSet<TxId> = BTreeSet::new();
                stage.insert(txid);
                self.remove_staged(&stage, RemovalReason::Block);
            } else {
                self.remove_conflicts(tx);
            }
            self.map_deltas.remove(&txid);
        }
        self.last_rolling_fee_update = now_secs();
        self.block_since_last_rolling_fee_bump = true;
    }

    /// Evicts lowest modified fee-rate entries (oldest first on ties) with
    /// their descendants until memory usage fits. Returns outpoints whose
    /// creating transaction is not in the pool and that now have no
    /// spenders, so the UTXO cache can uncache them.
    pub fn trim_to_size(&mut self, size_limit: usize) -> Vec<OutPoint> {
        let mut no_spends_remaining: Vec<OutPoint> = Vec::new();
        let mut removed = 0usize;
        let mut max_rate_removed = FeeRate::ZERO;

        while !self.map_tx.is_empty() && self.dynamic_memory_usage() > size_limit {
            let worst = self
                .map_tx
                .values()
                .min_by(|a, b| {
                    compare_fee_rates(a.modified_fee(), a.size(), b.modified_fee(), b.size())
                        .then_with(|| a.entry_id().cmp(&b.entry_id()))
                })
                .map(|entry| *entry.txid())
                .expect("pool is not empty");

            // Bump the floor past the evicted rate so nothing re-enters at
            // a rate that was just trimmed away.
            let evicted_rate = self.map_tx[&worst].modified_fee_rate();
            let bumped = FeeRate::from_sats_per_kb(
                evicted_rate
                    .sats_per_kb()
                    .saturating_add(MEMPOOL_FULL_FEE_INCREMENT),
            );
            self.track_package_removed(bumped);
            max_rate_removed = max_rate_removed.max(bumped);

            let mut stage: BTreeSet<TxId> = BTreeSet::new();
            self.calculate_descendants(&worst, &mut stage);
            removed += stage.len();

            for txid in &stage {
                for input in &self.map_tx[txid].tx().vin {
                    if !self.exists(&input.prevout.hash) {
                        no_spends_remaining.push(input.prevout.clone());
                    }
                }
            }
            self.remove_staged(&stage, RemovalReason::SizeLimit);
        }

        if removed > 0 {
            emberd_log::log_debug!(
                "trimmed {} transactions, rolling minimum fee bumped to {}",
                removed,
                max_rate_removed
            );
        }
        no_spends_remaining
    }

    /// Removes every entry accepted before `cutoff_time` along with its
    /// descendants. Returns the number of entries removed.
    pub fn expire(&mut self, cutoff_time: i64) -> usize {
        let mut stage: BTreeSet<TxId> = BTreeSet::new();
        for txid in self.by_entry_id.values() {
            let entry = self.map_tx.get(txid).expect("index entry resident");
            if entry.time() < cutoff_time {
                self.calculate_descendants(txid, &mut stage);
            }
        }
        let count = stage.len();
        self.remove_staged(&stage, RemovalReason::Expiry);
        count
    }

    /// Adjusts the persistent fee delta for `txid`. Applies to a resident
    /// entry immediately and is remembered for one not yet seen.
    pub fn prioritise_transaction(&mut self, txid: &TxId, fee_delta: Amount) {
        let delta = self.map_deltas.entry(*txid).or_insert(0);
        *delta = delta.saturating_add(fee_delta);
        let total = *delta;
        if let Some(entry) = self.map_tx.get_mut(txid) {
            entry.set_fee_delta(total);
        }
        emberd_log::log_info!(
            "prioritise {}: fee delta now {}",
            hash256_to_hex(txid),
            total
        );
    }

    /// Installs a saved delta verbatim, bypassing accumulation. Used when
    /// replaying a reorg queue.
    pub(crate) fn restore_delta(&mut self, txid: &TxId, fee_delta: Amount) {
        self.map_deltas.insert(*txid, fee_delta);
        if let Some(entry) = self.map_tx.get_mut(txid) {
            entry.set_fee_delta(fee_delta);
        }
    }

    pub fn clear_prioritisation(&mut self, txid: &TxId) {
        self.map_deltas.remove(txid);
    }

    pub fn deltas(&self) -> impl Iterator<Item = (&TxId, &Amount)> {
        self.map_deltas.iter()
    }

    /// True when `a` precedes `b` in the entry-id total order. A missing
    /// `a` sorts last, a missing `b` first, matching mining precedence.
    pub fn compare_topologically(&self, a: &TxId, b: &TxId) -> bool {
        let Some(entry_a) = self.map_tx.get(a) else {
            return false;
        };
        let Some(entry_b) = self.map_tx.get(b) else {
            return true;
        };
        entry_a.entry_id() < entry_b.entry_id()
    }

    fn track_package_removed(&mut self, rate: FeeRate) {
        if rate.sats_per_kb() as f64 > self.rolling_minimum_fee_rate {
            self.rolling_minimum_fee_rate = rate.sats_per_kb() as f64;
            self.block_since_last_rolling_fee_bump = false;
        }
    }

    /// The rolling minimum fee rate. Decays with a half-life once a block
    /// has confirmed since the last bump, faster when the pool is far
    /// under its size limit, and latches to zero below half the full-pool
    /// increment.
    pub fn get_min_fee(&mut self, size_limit: usize) -> FeeRate {
        if !self.block_since_last_rolling_fee_bump || self.rolling_minimum_fee_rate == 0.0 {
            return FeeRate::from_sats_per_kb(self.rolling_minimum_fee_rate.ceil() as Amount);
        }
        let time = now_secs();
        if time > self.last_rolling_fee_update + 10 {
            let mut halflife = ROLLING_FEE_HALFLIFE;
            if self.dynamic_memory_usage() < size_limit / 4 {
                halflife /= 4;
            } else if self.dynamic_memory_usage() < size_limit / 2 {
                halflife /= 2;
            }
            self.rolling_minimum_fee_rate /=
                2f64.powf((time - self.last_rolling_fee_update) as f64 / halflife as f64);
            self.last_rolling_fee_update = time;
            if self.rolling_minimum_fee_rate < (MEMPOOL_FULL_FEE_INCREMENT / 2) as f64 {
                self.rolling_minimum_fee_rate = 0.0;
                return FeeRate::ZERO;
            }
        }
        FeeRate::from_sats_per_kb(self.rolling_minimum_fee_rate.ceil() as Amount)
    }

    /// Fee-rate estimate for relay: the larger of the caller's relay floor
    /// and the rolling minimum.
    pub fn estimate_fee(&mut self, relay_floor: FeeRate, size_limit: usize) -> FeeRate {
        relay_floor.max(self.get_min_fee(size_limit))
    }

    pub fn info(&self, txid: &TxId) -> Option<TxMempoolInfo> {
        self.map_tx.get(txid).map(|entry| TxMempoolInfo {
            tx: entry.shared_tx(),
            time: entry.time(),
            fee_rate: entry.fee_rate(),
            fee_delta: entry.fee_delta(),
        })
    }

    pub fn info_all(&self) -> Vec<TxMempoolInfo> {
        self.by_entry_id
            .values()
            .filter_map(|txid| self.info(txid))
            .collect()
    }

    pub fn clear(&mut self, clear_dsp_orphans: bool) {
        self.map_tx.clear();
        self.by_entry_id.clear();
        self.map_links.clear();
        self.map_next_tx.clear();
        self.map_deltas.clear();
        self.total_tx_size = 0;
        self.rolling_minimum_fee_rate = 0.0;
        self.last_rolling_fee_update = now_secs();
        self.block_since_last_rolling_fee_bump = false;
        self.dsp_storage.clear(clear_dsp_orphans);
    }

    pub fn dsp_storage(&self) -> &DoubleSpendProofStorage {
        &self.dsp_storage
    }

    pub fn dsp_storage_mut(&mut self) -> &mut DoubleSpendProofStorage {
        &mut self.dsp_storage
    }

    /// Associates a proof with the resident transaction spending the
    /// disputed outpoint. Returns that transaction when the association was
    /// made, None when no spender is resident or it already has a proof.
    pub fn add_double_spend_proof(
        &mut self,
        proof: DoubleSpendProof,
        now: i64,
    ) -> Option<Arc<Transaction>> {
        let spender = *self.map_next_tx.get(proof.out_point())?;
        let entry = self.map_tx.get(&spender)?;
        if entry.has_dsp() {
            return None;
        }
        let dsp_id = proof.dsp_id();
        self.dsp_storage.add(proof, now);
        let entry = self
            .map_tx
            .get_mut(&spender)
            .expect("spender still resident");
        entry.set_dsp_id(dsp_id);
        Some(entry.shared_tx())
    }

    /// Walks `txid` and its in-mempool ancestors looking for an associated
    /// proof. On a hit, returns the proof id and the query path from the
    /// starting transaction down to the proven one.
    pub fn recursive_dsproof_search(
        &self,
        txid: &TxId,
    ) -> Result<Option<(DspId, Vec<TxId>)>, DspSearchError> {
        let mut path: Vec<TxId> = Vec::new();
        let mut seen: BTreeSet<TxId> = BTreeSet::new();
        let mut stack: Vec<Frame> = Vec::new();

        if let Some(dsp_id) = self.dsp_search_enter(txid, &mut path, &mut stack)? {
            return Ok(Some((dsp_id, path)));
        }
        while let Some(frame) = stack.last_mut() {
            if frame.next < frame.parents.len() {
                let parent = frame.parents[frame.next];
                frame.next += 1;
                if !seen.insert(parent) {
                    continue;
                }
                if let Some(dsp_id) = self.dsp_search_enter(&parent, &mut path, &mut stack)? {
                    return Ok(Some((dsp_id, path)));
                }
            } else {
                stack.pop();
                path.pop();
            }
        }
        Ok(None)
    }

    /// Steps the proof search into `txid`: records it on the path, reports
    /// a directly associated proof, or schedules its parents for descent.
    fn dsp_search_enter(
        &self,
        txid: &TxId,
        path: &mut Vec<TxId>,
        stack: &mut Vec<Frame>,
    ) -> Result<Option<DspId>, DspSearchError> {
        path.push(*txid);
        if path.len() > DSPROOF_RECURSION_LIMIT {
            return Err(DspSearchError::RecursionLimitReached);
        }
        let parents = match self.map_tx.get(txid) {
            Some(entry) => {
                if let Some(dsp_id) = entry.dsp_id() {
                    return Ok(Some(*dsp_id));
                }
                self.map_links
                    .get(txid)
                    .map(|links| links.parents.iter().cloned().collect())
                    .unwrap_or_default()
            }
            // The query transaction itself need not be resident.
            None => Vec::new(),
        };
        stack.push(Frame { parents, next: 0 });
        Ok(None)
    }

    /// Consistency pass: every invariant the three indices and the linkage
    /// graph are supposed to maintain, recomputed from scratch. Violations
    /// are programming errors and panic. Intended for tests and sampled
    /// diagnostics, not the production path.
    pub fn check(&self, coins: &impl CoinView) {
        let mut total: u64 = 0;
        for (txid, entry) in &self.map_tx {
            assert_eq!(txid, entry.txid());
            total += entry.size() as u64;
            let links = self.map_links.get(txid).expect("every entry has links");

            let mut parents_check: BTreeSet<TxId> = BTreeSet::new();
            for input in &entry.tx().vin {
                if let Some(parent) = self.map_tx.get(&input.prevout.hash) {
                    assert!(
                        (input.prevout.index as usize) < parent.tx().vout.len(),
                        "input references a missing parent output"
                    );
                    assert!(
                        parent.entry_id() < entry.entry_id(),
                        "parent inserted after child"
                    );
                    parents_check.insert(*parent.txid());
                } else {
                    assert!(
                        coins.have_coin(&input.prevout),
                        "input neither resident nor in the utxo set"
                    );
                }
                assert_eq!(self.map_next_tx.get(&input.prevout), Some(txid));
            }
            assert_eq!(&parents_check, &links.parents);

            let mut children_check: BTreeSet<TxId> = BTreeSet::new();
            for index in 0..entry.tx().vout.len() as u32 {
                if let Some(spender) = self.map_next_tx.get(&OutPoint::new(*txid, index)) {
                    assert!(self.map_tx.contains_key(spender));
                    children_check.insert(*spender);
                }
            }
            assert_eq!(&children_check, &links.children);
        }

        for (outpoint, spender) in &self.map_next_tx {
            let entry = self
                .map_tx
                .get(spender)
                .expect("map_next_tx points at a resident tx");
            assert!(entry.tx().vin.iter().any(|input| &input.prevout == outpoint));
        }

        assert_eq!(total, self.total_tx_size);
        assert_eq!(self.by_entry_id.len(), self.map_tx.len());
    }
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::coin::Coin;
    use emberd_primitives::transaction::{TxIn, TxOut, SEQUENCE_FINAL};

    fn confirmed_out(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    // One 70-byte signature push, hashtype ALL|FORKID.
    fn sig_script() -> Vec<u8> {
        let mut sig = vec![0x30u8; 70];
        sig[69] = 0x41;
        let mut script = vec![70u8];
        script.extend_from_slice(&sig);
        script
    }

    fn spend(prevouts: &[OutPoint], value: Amount) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: 1,
            vin: prevouts
                .iter()
                .map(|prevout| TxIn::new(prevout.clone(), sig_script(), SEQUENCE_FINAL))
                .collect(),
            vout: vec![TxOut::new(value, vec![0x51])],
            lock_time: 0,
        })
    }

    fn entry(tx: &Arc<Transaction>, fee: Amount, time: i64) -> TxMempoolEntry {
        TxMempoolEntry::new(Arc::clone(tx), fee, time, 1, false, 1)
    }

    fn coins_for(outpoints: &[OutPoint]) -> HashMap<OutPoint, Coin> {
        outpoints
            .iter()
            .map(|outpoint| {
                (
                    outpoint.clone(),
                    Coin::new(TxOut::new(100_000, vec![0x51]), 1, false),
                )
            })
            .collect()
    }

    #[test]
    fn entry_order_and_links_track_insertion() {
        let mut pool = Mempool::new();
        let coins = coins_for(&[confirmed_out(1)]);

        let parent = spend(&[confirmed_out(1)], 90_000);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 80_000);
        let parent_id = pool.add_unchecked(entry(&parent, 1_000, 100));
        let child_id = pool.add_unchecked(entry(&child, 1_000, 101));

        assert!(parent_id < child_id);
        assert_eq!(
            pool.parents_of(&child.txid()).unwrap().iter().next(),
            Some(&parent.txid())
        );
        assert_eq!(
            pool.children_of(&parent.txid()).unwrap().iter().next(),
            Some(&child.txid())
        );
        assert!(pool.compare_topologically(&parent.txid(), &child.txid()));
        assert!(!pool.compare_topologically(&child.txid(), &parent.txid()));
        assert_eq!(pool.txids_by_entry_order(), vec![parent.txid(), child.txid()]);
        pool.check(&coins);
    }

    #[test]
    fn ancestor_walk_enforces_count_limit() {
        let mut pool = Mempool::new();
        let a = spend(&[confirmed_out(1)], 90_000);
        let b = spend(&[OutPoint::new(a.txid(), 0)], 80_000);
        pool.add_unchecked(entry(&a, 1_000, 100));
        pool.add_unchecked(entry(&b, 1_000, 101));

        let candidate = spend(&[OutPoint::new(b.txid(), 0)], 70_000);
        let ok = pool
            .calculate_ancestors(&candidate, candidate.total_size(), &AncestorLimits::default())
            .unwrap();
        assert_eq!(ok.len(), 2);

        let tight = AncestorLimits {
            max_ancestor_count: 2,
            max_ancestor_size: 101_000,
        };
        let err = pool
            .calculate_ancestors(&candidate, candidate.total_size(), &tight)
            .unwrap_err();
        assert_eq!(err.kind, MempoolErrorKind::TooManyAncestors);
        assert!(err.message.contains("limit: 2"), "{err}");
    }

    #[test]
    fn calculate_descendants_is_idempotent() {
        let mut pool = Mempool::new();
        let a = spend(&[confirmed_out(1)], 90_000);
        let b = spend(&[OutPoint::new(a.txid(), 0)], 80_000);
        let c = spend(&[OutPoint::new(b.txid(), 0)], 70_000);
        pool.add_unchecked(entry(&a, 1_000, 100));
        pool.add_unchecked(entry(&b, 1_000, 101));
        pool.add_unchecked(entry(&c, 1_000, 102));

        let mut set = BTreeSet::new();
        pool.calculate_descendants(&a.txid(), &mut set);
        assert_eq!(set.len(), 3);
        pool.calculate_descendants(&b.txid(), &mut set);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn trim_evicts_lowest_feerate_package_and_bumps_floor() {
        let mut pool = Mempool::new();
        let low = spend(&[confirmed_out(1)], 99_000);
        let low_child = spend(&[OutPoint::new(low.txid(), 0)], 98_000);
        let high = spend(&[confirmed_out(2)], 90_000);
        pool.add_unchecked(entry(&low, 100, 100));
        pool.add_unchecked(entry(&low_child, 110, 101));
        pool.add_unchecked(entry(&high, 1_000_000, 102));

        let limit = pool.dynamic_memory_usage() - 1;
        let no_spends = pool.trim_to_size(limit);

        assert!(!pool.exists(&low.txid()));
        assert!(!pool.exists(&low_child.txid()));
        assert!(pool.exists(&high.txid()));
        assert_eq!(no_spends, vec![confirmed_out(1)]);

        let low_rate = FeeRate::from_fee_and_size(100, low.total_size());
        let floor = pool.get_min_fee(usize::MAX);
        assert!(
            floor.sats_per_kb() >= low_rate.sats_per_kb() + MEMPOOL_FULL_FEE_INCREMENT,
            "floor {floor} below evicted rate {low_rate}"
        );
    }

    #[test]
    fn prioritisation_survives_arrival_order() {
        let mut pool = Mempool::new();
        let tx = spend(&[confirmed_out(1)], 90_000);
        pool.prioritise_transaction(&tx.txid(), 5_000);
        pool.add_unchecked(entry(&tx, 1_000, 100));
        let resident = pool.get(&tx.txid()).unwrap();
        assert_eq!(resident.modified_fee(), 6_000);

        pool.prioritise_transaction(&tx.txid(), -2_000);
        assert_eq!(pool.get(&tx.txid()).unwrap().modified_fee(), 4_000);
    }

    #[test]
    fn remove_for_block_drops_conflicts_recursively() {
        let mut pool = Mempool::new();
        let tx_a = spend(&[confirmed_out(1)], 90_000);
        let child_a = spend(&[OutPoint::new(tx_a.txid(), 0)], 80_000);
        let tx_c = spend(&[confirmed_out(2)], 90_000);
        let child_c = spend(&[OutPoint::new(tx_c.txid(), 0)], 80_000);
        pool.add_unchecked(entry(&tx_a, 1_000, 100));
        pool.add_unchecked(entry(&child_a, 1_000, 101));
        pool.add_unchecked(entry(&tx_c, 1_000, 102));
        pool.add_unchecked(entry(&child_c, 1_000, 103));

        // tx_b confirms and spends the same coin as tx_a; tx_c confirms
        // directly.
        let tx_b = spend(&[confirmed_out(1)], 89_000);
        pool.remove_for_block(&[tx_b, Arc::clone(&tx_c)]);

        assert!(!pool.exists(&tx_a.txid()));
        assert!(!pool.exists(&child_a.txid()));
        assert!(!pool.exists(&tx_c.txid()));
        assert!(pool.exists(&child_c.txid()));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn expire_takes_descendants_along() {
        let mut pool = Mempool::new();
        let parent = spend(&[confirmed_out(1)], 90_000);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 80_000);
        let fresh = spend(&[confirmed_out(2)], 90_000);
        pool.add_unchecked(entry(&parent, 1_000, 100));
        pool.add_unchecked(entry(&child, 1_000, 200));
        pool.add_unchecked(entry(&fresh, 1_000, 300));

        assert_eq!(pool.expire(150), 2);
        assert!(!pool.exists(&parent.txid()));
        assert!(!pool.exists(&child.txid()));
        assert!(pool.exists(&fresh.txid()));
    }

    #[test]
    fn dsproof_association_and_ancestor_search() {
        let mut pool = Mempool::new();
        let disputed = confirmed_out(7);
        let tx1 = spend(&[disputed.clone()], 90_000);
        let tx2 = spend(&[disputed.clone()], 89_000);
        let child = spend(&[OutPoint::new(tx1.txid(), 0)], 80_000);
        pool.add_unchecked(entry(&tx1, 1_000, 100));
        pool.add_unchecked(entry(&child, 1_000, 101));

        let proof = DoubleSpendProof::create(&tx1, &tx2, &disputed).unwrap();
        let dsp_id = proof.dsp_id();
        let spender = pool.add_double_spend_proof(proof.clone(), 100).unwrap();
        assert_eq!(spender.txid(), tx1.txid());

        // A second proof for the same spender is ignored.
        assert!(pool.add_double_spend_proof(proof, 101).is_none());

        let (found, path) = pool
            .recursive_dsproof_search(&child.txid())
            .unwrap()
            .expect("proof reachable through parent");
        assert_eq!(found, dsp_id);
        assert_eq!(path, vec![child.txid(), tx1.txid()]);

        assert!(pool
            .recursive_dsproof_search(&tx2.txid())
            .unwrap()
            .is_none());
    }

    #[test]
    fn removal_orphans_associated_proof() {
        let mut pool = Mempool::new();
        let disputed = confirmed_out(3);
        let tx1 = spend(&[disputed.clone()], 90_000);
        let tx2 = spend(&[disputed.clone()], 89_000);
        pool.add_unchecked(entry(&tx1, 1_000, 100));

        let proof = DoubleSpendProof::create(&tx1, &tx2, &disputed).unwrap();
        let dsp_id = proof.dsp_id();
        pool.add_double_spend_proof(proof, 100).unwrap();
        assert_eq!(pool.dsp_storage().is_orphan(&dsp_id), Some(false));

        pool.remove_recursive(&tx1, RemovalReason::Manual);
        assert_eq!(pool.dsp_storage().is_orphan(&dsp_id), Some(true));
    }
}
