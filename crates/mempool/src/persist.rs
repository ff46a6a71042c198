//! Mempool and proof persistence across restarts.
//!
//! Both dumps are versioned flat files written through the consensus
//! encoder. A dump goes to `<path>.new` first and is renamed into place,
//! so a crash mid-write never corrupts the previous snapshot. Loading
//! returns parsed records; the caller resubmits them through normal
//! admission, which re-checks inputs against the current chain.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use emberd_consensus::Amount;
use emberd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use emberd_primitives::transaction::{Transaction, TxId};

use crate::dsproof::DoubleSpendProof;
use crate::pool::Mempool;

pub const MEMPOOL_DUMP_VERSION: u32 = 1;
pub const DSPROOFS_DUMP_VERSION: u32 = 1;

/// One transaction as it existed in the pool at dump time.
#[derive(Clone, Debug)]
pub struct SnapshotEntry {
    pub tx: Arc<Transaction>,
    pub time: i64,
    pub fee_delta: Amount,
    pub height: i32,
}

/// A parsed mempool dump: entries in original acceptance order, plus fee
/// deltas that had no resident transaction.
#[derive(Debug, Default)]
pub struct MempoolSnapshot {
    pub entries: Vec<SnapshotEntry>,
    pub deltas: Vec<(TxId, Amount)>,
}

fn invalid_data(err: DecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("new");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Writes every pool entry (acceptance order) and all outstanding fee
/// deltas to `path`.
pub fn dump_mempool(pool: &Mempool, path: &Path) -> io::Result<()> {
    let mut enc = Encoder::new();
    enc.write_u32_le(MEMPOOL_DUMP_VERSION);
    enc.write_varint(pool.size() as u64);
    for entry in pool.entries_by_entry_order() {
        entry.tx().consensus_encode(&mut enc);
        enc.write_i64_le(entry.time());
        enc.write_i64_le(entry.fee_delta());
        enc.write_i32_le(entry.entry_height());
    }
    let deltas: Vec<(&TxId, &Amount)> = pool.deltas().collect();
    enc.write_varint(deltas.len() as u64);
    for (txid, delta) in deltas {
        enc.write_hash_le(txid);
        enc.write_i64_le(*delta);
    }

    let bytes = enc.into_inner();
    write_atomically(path, &bytes)?;
    emberd_log::log_info!(
        "dumped {} mempool transactions to {}",
        pool.size(),
        path.display()
    );
    Ok(())
}

pub fn load_mempool(path: &Path) -> io::Result<MempoolSnapshot> {
    let bytes = fs::read(path)?;
    let mut dec = Decoder::new(&bytes);

    let version = dec.read_u32_le().map_err(invalid_data)?;
    if version != MEMPOOL_DUMP_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported mempool dump version {version}"),
        ));
    }

    let count = dec.read_varint().map_err(invalid_data)?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let tx = Transaction::consensus_decode(&mut dec).map_err(invalid_data)?;
        let time = dec.read_i64_le().map_err(invalid_data)?;
        let fee_delta = dec.read_i64_le().map_err(invalid_data)?;
        let height = dec.read_i32_le().map_err(invalid_data)?;
        entries.push(SnapshotEntry {
            tx: Arc::new(tx),
            time,
            fee_delta,
            height,
        });
    }

    let delta_count = dec.read_varint().map_err(invalid_data)?;
    let mut deltas = Vec::new();
    for _ in 0..delta_count {
        let txid = dec.read_hash_le().map_err(invalid_data)?;
        let delta = dec.read_i64_le().map_err(invalid_data)?;
        deltas.push((txid, delta));
    }
    // Fields appended by newer writers are ignored; only an explicit
    // version bump is fatal.
    if !dec.is_empty() {
        emberd_log::log_debug!(
            "ignoring {} trailing bytes in mempool dump {}",
            dec.remaining(),
            path.display()
        );
    }

    emberd_log::log_info!(
        "loaded {} mempool transactions from {}",
        entries.len(),
        path.display()
    );
    Ok(MempoolSnapshot { entries, deltas })
}

/// Writes every stored proof. Orphans carry an all-zero associated txid.
pub fn dump_dsproofs(pool: &Mempool, path: &Path) -> io::Result<()> {
    let storage = pool.dsp_storage();
    let mut proofs: Vec<(&DoubleSpendProof, TxId)> = Vec::new();
    for (proof, _orphan) in storage.all() {
        let id = proof.dsp_id();
        let associated = pool
            .txids_by_entry_order()
            .into_iter()
            .find(|txid| pool.get(txid).and_then(|entry| entry.dsp_id()) == Some(&id))
            .unwrap_or([0u8; 32]);
        proofs.push((proof, associated));
    }

    let mut enc = Encoder::new();
    enc.write_u32_le(DSPROOFS_DUMP_VERSION);
    enc.write_varint(proofs.len() as u64);
    for (proof, associated) in &proofs {
        proof.consensus_encode(&mut enc);
        enc.write_hash_le(associated);
    }

    let bytes = enc.into_inner();
    write_atomically(path, &bytes)?;
    emberd_log::log_info!(
        "dumped {} double-spend proofs to {}",
        proofs.len(),
        path.display()
    );
    Ok(())
}

/// Parses a proof dump. An all-zero txid marks a proof that was an orphan
/// at dump time.
pub fn load_dsproofs(path: &Path) -> io::Result<Vec<(DoubleSpendProof, Option<TxId>)>> {
    let bytes = fs::read(path)?;
    let mut dec = Decoder::new(&bytes);

    let version = dec.read_u32_le().map_err(invalid_data)?;
    if version != DSPROOFS_DUMP_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported dsproof dump version {version}"),
        ));
    }

    let count = dec.read_varint().map_err(invalid_data)?;
    let mut proofs = Vec::new();
    for _ in 0..count {
        let proof = DoubleSpendProof::consensus_decode(&mut dec).map_err(invalid_data)?;
        let txid = dec.read_hash_le().map_err(invalid_data)?;
        let associated = if txid == [0u8; 32] { None } else { Some(txid) };
        proofs.push((proof, associated));
    }
    if !dec.is_empty() {
        emberd_log::log_debug!(
            "ignoring {} trailing bytes in dsproof dump {}",
            dec.remaining(),
            path.display()
        );
    }
    Ok(proofs)
}

/// Restores proofs into storage: associated ones are re-linked when their
/// transaction is resident, everything else enters as an orphan.
pub fn restore_dsproofs(
    pool: &mut Mempool,
    proofs: Vec<(DoubleSpendProof, Option<TxId>)>,
    now: i64,
) -> usize {
    let mut restored = 0usize;
    for (proof, associated) in proofs {
        match associated {
            Some(txid) if pool.exists(&txid) => {
                if pool.add_double_spend_proof(proof, now).is_some() {
                    restored += 1;
                }
            }
            _ => {
                pool.dsp_storage_mut().add_orphan(proof, now);
                restored += 1;
            }
        }
    }
    restored
}
