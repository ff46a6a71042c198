//! Holding area for transactions from disconnected blocks during a reorg.
//!
//! The queue is ordered: insertion appends, replay walks the queue in
//! reverse. Blocks are disconnected tip-first, so appending each block's
//! transactions newest-first leaves parents nearer the end, where reverse
//! replay resubmits them before their children.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use emberd_consensus::constants::MAX_DISCONNECTED_TX_POOL_SIZE;
use emberd_consensus::Amount;
use emberd_primitives::hash::hash256_to_hex;
use emberd_primitives::transaction::{Transaction, TxId};

use crate::pool::{now_secs, Mempool, RemovalReason};

/// Entry metadata preserved across a reorg so resubmission can restore it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxInfo {
    pub time: i64,
    pub fee_delta: Amount,
    pub height: i32,
}

/// Estimated bookkeeping bytes per queued transaction beyond its
/// serialized size.
const QUEUED_TX_OVERHEAD: usize = 128;

#[derive(Default)]
pub struct DisconnectedBlockTransactions {
    queued: Vec<Arc<Transaction>>,
    queued_txids: HashSet<TxId>,
    tx_info: HashMap<TxId, TxInfo>,
    cached_usage: usize,
}

impl DisconnectedBlockTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.cached_usage
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.queued_txids.contains(txid)
    }

    pub fn tx_info(&self, txid: &TxId) -> Option<&TxInfo> {
        self.tx_info.get(txid)
    }

    /// Replay order: reverse of insertion, so parents come back first.
    pub fn iter_replay(&self) -> impl Iterator<Item = &Arc<Transaction>> {
        self.queued.iter().rev()
    }

    /// Queues the transactions of a disconnected block. `vtx` is in block
    /// (topological) order; it is walked in reverse so children land before
    /// their in-block parents. Parents already queued ahead of a child are
    /// bubbled to the end so reverse replay still sees them first. Evicts
    /// from the live mempool if the queue outgrows its memory cap.
    pub fn add_for_block(&mut self, vtx: &[Arc<Transaction>], pool: &mut Mempool) {
        for tx in vtx.iter().rev() {
            let txid = tx.txid();
            if !self.queued_txids.insert(txid) {
                continue;
            }
            self.cached_usage += tx.total_size() + QUEUED_TX_OVERHEAD;
            self.queued.push(Arc::clone(tx));

            let mut worklist: Vec<Arc<Transaction>> = vec![Arc::clone(tx)];
            while let Some(next) = worklist.pop() {
                for input in &next.vin {
                    let parent_txid = input.prevout.hash;
                    if !self.queued_txids.contains(&parent_txid) {
                        continue;
                    }
                    let position = self
                        .queued
                        .iter()
                        .position(|queued| queued.txid() == parent_txid)
                        .expect("queued txid has a queue slot");
                    // Already at the end means already replaying first.
                    if position + 1 == self.queued.len() {
                        continue;
                    }
                    let parent = self.queued.remove(position);
                    worklist.push(Arc::clone(&parent));
                    self.queued.push(parent);
                }
            }
        }
        self.limit_size(pool, MAX_DISCONNECTED_TX_POOL_SIZE);
    }

    /// Moves the entire mempool into the queue, preserving entry metadata.
    /// Queued mempool content is spliced to the front so it replays after
    /// every disconnected block's transactions.
    pub fn import_mempool(&mut self, pool: &mut Mempool) {
        let vtx: Vec<Arc<Transaction>> = pool
            .entries_by_entry_order()
            .map(|entry| entry.shared_tx())
            .collect();
        for entry in pool.entries_by_entry_order() {
            self.tx_info.insert(
                *entry.txid(),
                TxInfo {
                    time: entry.time(),
                    fee_delta: entry.fee_delta(),
                    height: entry.entry_height(),
                },
            );
        }
        pool.dsp_storage_mut().orphan_all(now_secs());
        pool.clear(false);

        let mut imported = DisconnectedBlockTransactions::new();
        imported.add_for_block(&vtx, pool);

        let mut queued = imported.queued;
        let mut queued_txids = imported.queued_txids;
        queued.extend(self.queued.drain(..));
        queued_txids.extend(self.queued_txids.drain());
        self.queued = queued;
        self.queued_txids = queued_txids;
        self.cached_usage += imported.cached_usage;
    }

    /// Drops transactions confirmed by a newly connected block.
    pub fn remove_for_block(&mut self, confirmed: &[Arc<Transaction>]) {
        if self.queued.is_empty() {
            return;
        }
        let confirmed_txids: HashSet<TxId> = confirmed.iter().map(|tx| tx.txid()).collect();
        self.queued.retain(|tx| {
            let txid = tx.txid();
            if confirmed_txids.contains(&txid) {
                self.queued_txids.remove(&txid);
                self.tx_info.remove(&txid);
                self.cached_usage -= tx.total_size() + QUEUED_TX_OVERHEAD;
                false
            } else {
                true
            }
        });
    }

    /// Evicts from the front of the queue (replays last, cannot have queued
    /// children) until memory usage fits, removing any trace of the evicted
    /// transactions from the live mempool too.
    fn limit_size(&mut self, pool: &mut Mempool, max_usage: usize) {
        while self.cached_usage > max_usage && !self.queued.is_empty() {
            let evicted = self.queued.remove(0);
            let txid = evicted.txid();
            self.queued_txids.remove(&txid);
            self.tx_info.remove(&txid);
            self.cached_usage -= evicted.total_size() + QUEUED_TX_OVERHEAD;
            pool.remove_recursive(&evicted, RemovalReason::Reorg);
            emberd_log::log_warn!(
                "reorg queue over limit, dropping {}",
                hash256_to_hex(&txid)
            );
        }
    }

    pub fn clear(&mut self) {
        self.queued.clear();
        self.queued_txids.clear();
        self.tx_info.clear();
        self.cached_usage = 0;
    }
}

/// Replays the queue into the mempool after a reorg settles. `resubmit`
/// runs full admission for one transaction and reports acceptance; saved
/// fee deltas are restored before the attempt and rolled back when it
/// fails. With `add_to_mempool` false (e.g. an invalid chain) everything is
/// discarded instead. The queue is drained either way; the caller applies
/// expiry and size limiting afterwards.
pub fn update_mempool_for_reorg<F>(
    pool: &mut Mempool,
    queue: &mut DisconnectedBlockTransactions,
    add_to_mempool: bool,
    mut resubmit: F,
) where
    F: FnMut(&mut Mempool, &Arc<Transaction>, Option<&TxInfo>) -> bool,
{
    let mut resubmitted = 0usize;
    let mut dropped = 0usize;
    for tx in queue.queued.iter().rev() {
        let txid = tx.txid();
        if !add_to_mempool || tx.is_coinbase() {
            pool.remove_recursive(tx, RemovalReason::Reorg);
            dropped += 1;
            continue;
        }
        let info = queue.tx_info.get(&txid);
        let restored_delta = match info {
            Some(info) if info.fee_delta != 0 => {
                pool.restore_delta(&txid, info.fee_delta);
                true
            }
            _ => false,
        };
        if resubmit(pool, tx, info) {
            resubmitted += 1;
        } else {
            if restored_delta {
                pool.clear_prioritisation(&txid);
            }
            pool.remove_recursive(tx, RemovalReason::Reorg);
            dropped += 1;
        }
    }
    queue.clear();
    emberd_log::log_info!(
        "reorg replay finished: {} resubmitted, {} dropped",
        resubmitted,
        dropped
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::TxMempoolEntry;
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{TxIn, TxOut, SEQUENCE_FINAL};

    fn confirmed_out(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    fn spend(prevouts: &[OutPoint], value: Amount) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: 1,
            vin: prevouts
                .iter()
                .map(|prevout| TxIn::new(prevout.clone(), vec![0x51], SEQUENCE_FINAL))
                .collect(),
            vout: vec![TxOut::new(value, vec![0x51])],
            lock_time: 0,
        })
    }

    fn entry(tx: &Arc<Transaction>, fee: Amount, time: i64) -> TxMempoolEntry {
        TxMempoolEntry::new(Arc::clone(tx), fee, time, 1, false, 1)
    }

    fn replay_txids(queue: &DisconnectedBlockTransactions) -> Vec<TxId> {
        queue.iter_replay().map(|tx| tx.txid()).collect()
    }

    #[test]
    fn replay_order_runs_parents_first() {
        let mut pool = Mempool::new();
        let mut queue = DisconnectedBlockTransactions::new();
        let parent = spend(&[confirmed_out(1)], 90_000);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 80_000);

        queue.add_for_block(&[Arc::clone(&parent), Arc::clone(&child)], &mut pool);
        assert_eq!(replay_txids(&queue), vec![parent.txid(), child.txid()]);
    }

    #[test]
    fn queued_parents_bubble_past_their_children() {
        let mut pool = Mempool::new();
        let mut queue = DisconnectedBlockTransactions::new();
        let parent = spend(&[confirmed_out(1)], 90_000);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 80_000);

        // Child listed ahead of its parent: the worklist must still put
        // the parent at the replay front.
        queue.add_for_block(&[Arc::clone(&child), Arc::clone(&parent)], &mut pool);
        assert_eq!(replay_txids(&queue), vec![parent.txid(), child.txid()]);
    }

    #[test]
    fn limit_size_drops_from_the_front() {
        let mut pool = Mempool::new();
        let mut queue = DisconnectedBlockTransactions::new();
        let first = spend(&[confirmed_out(1)], 90_000);
        let second = spend(&[confirmed_out(2)], 90_000);
        queue.add_for_block(&[Arc::clone(&first)], &mut pool);
        queue.add_for_block(&[Arc::clone(&second)], &mut pool);

        let keep_one = second.total_size() + QUEUED_TX_OVERHEAD;
        queue.limit_size(&mut pool, keep_one);
        assert_eq!(replay_txids(&queue), vec![second.txid()]);
        assert!(!queue.contains(&first.txid()));
    }

    #[test]
    fn import_mempool_replays_after_disconnected_blocks() {
        let mut pool = Mempool::new();
        let mut queue = DisconnectedBlockTransactions::new();

        let from_block = spend(&[confirmed_out(1)], 90_000);
        queue.add_for_block(&[Arc::clone(&from_block)], &mut pool);

        let resident = spend(&[confirmed_out(2)], 90_000);
        pool.add_unchecked(entry(&resident, 1_000, 123));
        pool.prioritise_transaction(&resident.txid(), 4_000);

        queue.import_mempool(&mut pool);
        assert!(pool.is_empty());
        assert_eq!(
            replay_txids(&queue),
            vec![from_block.txid(), resident.txid()]
        );
        let info = queue.tx_info(&resident.txid()).unwrap();
        assert_eq!(info.time, 123);
        assert_eq!(info.fee_delta, 4_000);
    }

    #[test]
    fn reorg_replay_restores_deltas_and_rolls_back_failures() {
        let mut pool = Mempool::new();
        let mut queue = DisconnectedBlockTransactions::new();
        let good = spend(&[confirmed_out(1)], 90_000);
        let bad = spend(&[confirmed_out(2)], 90_000);
        queue.add_for_block(&[Arc::clone(&good), Arc::clone(&bad)], &mut pool);
        queue.tx_info.insert(
            good.txid(),
            TxInfo {
                time: 50,
                fee_delta: 3_000,
                height: 7,
            },
        );
        queue.tx_info.insert(
            bad.txid(),
            TxInfo {
                time: 51,
                fee_delta: 9_000,
                height: 7,
            },
        );

        let bad_txid = bad.txid();
        update_mempool_for_reorg(&mut pool, &mut queue, true, |pool, tx, info| {
            if tx.txid() == bad_txid {
                return false;
            }
            let time = info.map(|info| info.time).unwrap_or(0);
            pool.add_unchecked(entry(tx, 1_000, time));
            true
        });

        assert!(queue.is_empty());
        assert!(pool.exists(&good.txid()));
        assert!(!pool.exists(&bad.txid()));
        // The accepted tx picked up its restored delta, the rejected one
        // left no delta behind.
        assert_eq!(pool.get(&good.txid()).unwrap().modified_fee(), 4_000);
        assert!(pool.deltas().all(|(txid, _)| txid != &bad_txid));
    }
}
