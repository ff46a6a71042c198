//! Double-spend proofs: a compact artifact showing that two transactions
//! spend the same outpoint, plus the storage that tracks them.

use std::collections::HashMap;
use std::fmt;

use emberd_consensus::constants::{DSPROOF_MAX_ORPHANS, DSPROOF_ORPHAN_KEEP_SECONDS};
use emberd_consensus::Hash256;
use emberd_primitives::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use emberd_primitives::hash::{hash256_to_hex, sha256d};
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::Transaction;
use emberd_script::sighash::{
    SIGHASH_ANYONECANPAY, SIGHASH_FORKID, SIGHASH_NONE, SIGHASH_SINGLE,
};

/// Hash of the serialized proof.
pub type DspId = Hash256;

pub const DSPROOF_VERSION: i32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DsProofError {
    /// Both transactions hash to the same txid.
    SameTransaction,
    /// One of the transactions does not spend the disputed outpoint.
    MissingSpend,
    /// The spending input carries no extractable signature push.
    MissingSignature,
    /// The signature does not commit to the fork id.
    NotForkId,
}

impl fmt::Display for DsProofError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsProofError::SameTransaction => write!(f, "transactions are identical"),
            DsProofError::MissingSpend => {
                write!(f, "transactions do not both spend the disputed outpoint")
            }
            DsProofError::MissingSignature => write!(f, "spending input has no signature push"),
            DsProofError::NotForkId => write!(f, "signature does not use the fork id"),
        }
    }
}

impl std::error::Error for DsProofError {}

/// One half of a proof: the sighash components of a single spender.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DspSpender {
    pub tx_version: i32,
    pub out_sequence: u32,
    pub lock_time: u32,
    pub hash_prevouts: Hash256,
    pub hash_sequence: Hash256,
    pub hash_outputs: Hash256,
    /// Signature pushes from the spender's script_sig. Exactly one entry.
    pub push_data: Vec<Vec<u8>>,
}

impl Encodable for DspSpender {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.tx_version);
        encoder.write_u32_le(self.out_sequence);
        encoder.write_u32_le(self.lock_time);
        encoder.write_hash_le(&self.hash_prevouts);
        encoder.write_hash_le(&self.hash_sequence);
        encoder.write_hash_le(&self.hash_outputs);
        encoder.write_varint(self.push_data.len() as u64);
        for push in &self.push_data {
            encoder.write_var_bytes(push);
        }
    }
}

impl Decodable for DspSpender {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tx_version = decoder.read_i32_le()?;
        let out_sequence = decoder.read_u32_le()?;
        let lock_time = decoder.read_u32_le()?;
        let hash_prevouts = decoder.read_hash_le()?;
        let hash_sequence = decoder.read_hash_le()?;
        let hash_outputs = decoder.read_hash_le()?;
        let count = decoder.read_varint()?;
        let mut push_data = Vec::with_capacity(count.min(16) as usize);
        for _ in 0..count {
            push_data.push(decoder.read_var_bytes()?);
        }
        Ok(Self {
            tx_version,
            out_sequence,
            lock_time,
            hash_prevouts,
            hash_sequence,
            hash_outputs,
            push_data,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DoubleSpendProof {
    out_point: OutPoint,
    spender1: DspSpender,
    spender2: DspSpender,
}

impl DoubleSpendProof {
    /// Assembles a proof from two transactions that both spend `prevout`.
    /// Spenders are stored in canonical order so equal conflicts always
    /// produce the same proof id.
    pub fn create(
        tx1: &Transaction,
        tx2: &Transaction,
        prevout: &OutPoint,
    ) -> Result<Self, DsProofError> {
        if tx1.txid() == tx2.txid() {
            return Err(DsProofError::SameTransaction);
        }
        let s1 = spender_for(tx1, prevout)?;
        let s2 = spender_for(tx2, prevout)?;

        let (spender1, spender2) = if canonical_order(&s1, &s2) {
            (s1, s2)
        } else {
            (s2, s1)
        };
        Ok(Self {
            out_point: prevout.clone(),
            spender1,
            spender2,
        })
    }

    pub fn from_parts(out_point: OutPoint, spender1: DspSpender, spender2: DspSpender) -> Self {
        Self {
            out_point,
            spender1,
            spender2,
        }
    }

    pub fn out_point(&self) -> &OutPoint {
        &self.out_point
    }

    pub fn spender1(&self) -> &DspSpender {
        &self.spender1
    }

    pub fn spender2(&self) -> &DspSpender {
        &self.spender2
    }

    pub fn dsp_id(&self) -> DspId {
        sha256d(&encoding::encode(self))
    }

    /// Spenders must be in canonical order and each must carry exactly one
    /// signature push.
    pub fn is_sane(&self) -> bool {
        canonical_order(&self.spender1, &self.spender2)
            && self.spender1.push_data.len() == 1
            && self.spender2.push_data.len() == 1
            && !self.spender1.push_data[0].is_empty()
            && !self.spender2.push_data[0].is_empty()
    }
}

impl Encodable for DoubleSpendProof {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(DSPROOF_VERSION);
        self.out_point.consensus_encode(encoder);
        self.spender1.consensus_encode(encoder);
        self.spender2.consensus_encode(encoder);
    }
}

impl Decodable for DoubleSpendProof {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        if version != DSPROOF_VERSION {
            return Err(DecodeError::InvalidData("unknown dsproof version"));
        }
        let out_point = OutPoint::consensus_decode(decoder)?;
        let spender1 = DspSpender::consensus_decode(decoder)?;
        let spender2 = DspSpender::consensus_decode(decoder)?;
        Ok(Self {
            out_point,
            spender1,
            spender2,
        })
    }
}

fn canonical_order(a: &DspSpender, b: &DspSpender) -> bool {
    match a.hash_outputs.cmp(&b.hash_outputs) {
        std::cmp::Ordering::Equal => a.hash_prevouts <= b.hash_prevouts,
        other => other == std::cmp::Ordering::Less,
    }
}

fn spender_for(tx: &Transaction, prevout: &OutPoint) -> Result<DspSpender, DsProofError> {
    let input = tx
        .vin
        .iter()
        .find(|input| &input.prevout == prevout)
        .ok_or(DsProofError::MissingSpend)?;

    let signature = first_push(&input.script_sig).ok_or(DsProofError::MissingSignature)?;
    let hash_type = u32::from(*signature.last().ok_or(DsProofError::MissingSignature)?);
    if hash_type & SIGHASH_FORKID == 0 {
        return Err(DsProofError::NotForkId);
    }
    let base_type = hash_type & 0x1f;

    let mut hash_prevouts = [0u8; 32];
    let mut hash_sequence = [0u8; 32];
    let mut hash_outputs = [0u8; 32];

    if hash_type & SIGHASH_ANYONECANPAY == 0 {
        let mut enc = Encoder::new();
        for txin in &tx.vin {
            txin.prevout.consensus_encode(&mut enc);
        }
        hash_prevouts = sha256d(&enc.into_inner());
    }
    if hash_type & SIGHASH_ANYONECANPAY == 0
        && base_type != SIGHASH_SINGLE
        && base_type != SIGHASH_NONE
    {
        let mut enc = Encoder::new();
        for txin in &tx.vin {
            enc.write_u32_le(txin.sequence);
        }
        hash_sequence = sha256d(&enc.into_inner());
    }
    if base_type != SIGHASH_SINGLE && base_type != SIGHASH_NONE {
        let mut enc = Encoder::new();
        for txout in &tx.vout {
            txout.consensus_encode(&mut enc);
        }
        hash_outputs = sha256d(&enc.into_inner());
    }

    Ok(DspSpender {
        tx_version: tx.version,
        out_sequence: input.sequence,
        lock_time: tx.lock_time,
        hash_prevouts,
        hash_sequence,
        hash_outputs,
        push_data: vec![signature],
    })
}

fn first_push(script_sig: &[u8]) -> Option<Vec<u8>> {
    let first = *script_sig.first()?;
    // Signatures always fit in a direct push.
    if first == 0 || usize::from(first) > 0x4b {
        return None;
    }
    let len = usize::from(first);
    if script_sig.len() < 1 + len {
        return None;
    }
    Some(script_sig[1..1 + len].to_vec())
}

struct StoredProof {
    proof: DoubleSpendProof,
    orphan: bool,
    time_stamp: i64,
}

/// In-memory store of proofs, keyed by id and indexed by the disputed
/// outpoint. Proofs not yet matched to a resident transaction are orphans
/// and expire after a short window.
#[derive(Default)]
pub struct DoubleSpendProofStorage {
    proofs: HashMap<DspId, StoredProof>,
    by_outpoint: HashMap<OutPoint, Vec<DspId>>,
    num_orphans: usize,
}

impl DoubleSpendProofStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.proofs.len()
    }

    pub fn num_orphans(&self) -> usize {
        self.num_orphans
    }

    /// Adds a proof as a non-orphan. Adding an existing orphan claims it.
    /// Returns false if the proof already existed as a non-orphan.
    pub fn add(&mut self, proof: DoubleSpendProof, now: i64) -> bool {
        let id = proof.dsp_id();
        if let Some(stored) = self.proofs.get_mut(&id) {
            if stored.orphan {
                stored.orphan = false;
                self.num_orphans -= 1;
            }
            return false;
        }
        self.index_outpoint(&id, proof.out_point().clone());
        self.proofs.insert(
            id,
            StoredProof {
                proof,
                orphan: false,
                time_stamp: now,
            },
        );
        true
    }

    /// Adds a proof flagged as an orphan; an existing non-orphan is
    /// recategorized.
    pub fn add_orphan(&mut self, proof: DoubleSpendProof, now: i64) {
        let id = proof.dsp_id();
        if let Some(stored) = self.proofs.get_mut(&id) {
            if !stored.orphan {
                stored.orphan = true;
                stored.time_stamp = now;
                self.num_orphans += 1;
            }
            return;
        }
        self.index_outpoint(&id, proof.out_point().clone());
        self.proofs.insert(
            id,
            StoredProof {
                proof,
                orphan: true,
                time_stamp: now,
            },
        );
        self.num_orphans += 1;
        self.enforce_orphan_limit();
    }

    pub fn remove(&mut self, id: &DspId) -> bool {
        let Some(stored) = self.proofs.remove(id) else {
            return false;
        };
        if stored.orphan {
            self.num_orphans -= 1;
        }
        self.unindex_outpoint(id, stored.proof.out_point());
        true
    }

    /// Flags a proof as claimed by a resident transaction.
    pub fn claim_orphan(&mut self, id: &DspId) {
        if let Some(stored) = self.proofs.get_mut(id) {
            if stored.orphan {
                stored.orphan = false;
                self.num_orphans -= 1;
            }
        }
    }

    /// Puts a proof back into the orphan pool, typically because its
    /// transaction left the mempool but may return after a reorg.
    pub fn orphan_existing(&mut self, id: &DspId, now: i64) {
        if let Some(stored) = self.proofs.get_mut(id) {
            if !stored.orphan {
                stored.orphan = true;
                stored.time_stamp = now;
                self.num_orphans += 1;
            }
        }
    }

    pub fn orphan_all(&mut self, now: i64) {
        for stored in self.proofs.values_mut() {
            if !stored.orphan {
                stored.orphan = true;
                stored.time_stamp = now;
                self.num_orphans += 1;
            }
        }
    }

    /// Orphan proof ids waiting on spenders of `outpoint`.
    pub fn find_orphans(&self, outpoint: &OutPoint) -> Vec<DspId> {
        let Some(ids) = self.by_outpoint.get(outpoint) else {
            return Vec::new();
        };
        ids.iter()
            .filter(|id| self.proofs.get(*id).is_some_and(|stored| stored.orphan))
            .cloned()
            .collect()
    }

    pub fn lookup(&self, id: &DspId) -> Option<&DoubleSpendProof> {
        self.proofs.get(id).map(|stored| &stored.proof)
    }

    pub fn exists(&self, id: &DspId) -> bool {
        self.proofs.contains_key(id)
    }

    pub fn is_orphan(&self, id: &DspId) -> Option<bool> {
        self.proofs.get(id).map(|stored| stored.orphan)
    }

    /// All proofs with their orphan flag, for persistence and RPC listing.
    pub fn all(&self) -> impl Iterator<Item = (&DoubleSpendProof, bool)> {
        self.proofs
            .values()
            .map(|stored| (&stored.proof, stored.orphan))
    }

    /// Expires orphans older than the keep window. Returns how many were
    /// dropped.
    pub fn periodic_cleanup(&mut self, now: i64) -> usize {
        let cutoff = now.saturating_sub(DSPROOF_ORPHAN_KEEP_SECONDS);
        let stale: Vec<DspId> = self
            .proofs
            .iter()
            .filter(|(_, stored)| stored.orphan && stored.time_stamp <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        let count = stale.len();
        for id in &stale {
            self.remove(id);
        }
        if count > 0 {
            emberd_log::log_debug!("dsproof cleanup dropped {} expired orphans", count);
        }
        count
    }

    pub fn clear(&mut self, clear_orphans: bool) {
        if clear_orphans {
            self.proofs.clear();
            self.by_outpoint.clear();
            self.num_orphans = 0;
            return;
        }
        let keep: Vec<DspId> = self
            .proofs
            .iter()
            .filter(|(_, stored)| stored.orphan)
            .map(|(id, _)| *id)
            .collect();
        let drop: Vec<DspId> = self
            .proofs
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        for id in drop {
            self.remove(&id);
        }
    }

    fn index_outpoint(&mut self, id: &DspId, outpoint: OutPoint) {
        self.by_outpoint.entry(outpoint).or_default().push(*id);
    }

    fn unindex_outpoint(&mut self, id: &DspId, outpoint: &OutPoint) {
        if let Some(ids) = self.by_outpoint.get_mut(outpoint) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_outpoint.remove(outpoint);
            }
        }
    }

    fn enforce_orphan_limit(&mut self) {
        while self.num_orphans > DSPROOF_MAX_ORPHANS {
            let Some(oldest) = self
                .proofs
                .iter()
                .filter(|(_, stored)| stored.orphan)
                .min_by_key(|(_, stored)| stored.time_stamp)
                .map(|(id, _)| *id)
            else {
                break;
            };
            emberd_log::log_debug!(
                "dsproof orphan limit reached, dropping {}",
                hash256_to_hex(&oldest)
            );
            self.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::transaction::{TxIn, TxOut, SEQUENCE_FINAL};
    use emberd_script::sighash::SIGHASH_ALL;

    fn spend_with_sig(prevout: OutPoint, sig_seed: u8, value: emberd_consensus::Amount) -> Transaction {
        let mut sig = vec![sig_seed; 70];
        *sig.last_mut().unwrap() = (SIGHASH_ALL | SIGHASH_FORKID) as u8;
        let mut script_sig = vec![70u8];
        script_sig.extend_from_slice(&sig);
        Transaction {
            version: 2,
            vin: vec![TxIn::new(prevout, script_sig, SEQUENCE_FINAL)],
            vout: vec![TxOut::new(value, vec![0x51])],
            lock_time: 0,
        }
    }

    fn conflicting_pair() -> (Transaction, Transaction, OutPoint) {
        let prevout = OutPoint::new([3u8; 32], 1);
        let tx1 = spend_with_sig(prevout.clone(), 0x41, 900);
        let tx2 = spend_with_sig(prevout.clone(), 0x42, 800);
        (tx1, tx2, prevout)
    }

    #[test]
    fn create_is_order_independent() {
        let (tx1, tx2, prevout) = conflicting_pair();
        let a = DoubleSpendProof::create(&tx1, &tx2, &prevout).expect("proof");
        let b = DoubleSpendProof::create(&tx2, &tx1, &prevout).expect("proof");
        assert_eq!(a.dsp_id(), b.dsp_id());
        assert!(a.is_sane());
    }

    #[test]
    fn create_rejects_non_conflicts() {
        let (tx1, _, _) = conflicting_pair();
        let err = DoubleSpendProof::create(&tx1, &tx1, &OutPoint::new([3u8; 32], 1));
        assert_eq!(err.unwrap_err(), DsProofError::SameTransaction);

        let other = spend_with_sig(OutPoint::new([4u8; 32], 0), 0x43, 700);
        let (tx1, _, prevout) = conflicting_pair();
        let err = DoubleSpendProof::create(&tx1, &other, &prevout);
        assert_eq!(err.unwrap_err(), DsProofError::MissingSpend);
    }

    #[test]
    fn proof_round_trips() {
        let (tx1, tx2, prevout) = conflicting_pair();
        let proof = DoubleSpendProof::create(&tx1, &tx2, &prevout).expect("proof");
        let bytes = encoding::encode(&proof);
        let decoded: DoubleSpendProof = encoding::decode(&bytes).expect("decode");
        assert_eq!(decoded, proof);
        assert_eq!(decoded.dsp_id(), proof.dsp_id());
    }

    #[test]
    fn orphans_expire_and_claim() {
        let (tx1, tx2, prevout) = conflicting_pair();
        let proof = DoubleSpendProof::create(&tx1, &tx2, &prevout).expect("proof");
        let id = proof.dsp_id();

        let mut storage = DoubleSpendProofStorage::new();
        storage.add_orphan(proof.clone(), 1_000);
        assert_eq!(storage.num_orphans(), 1);
        assert_eq!(storage.find_orphans(&prevout), vec![id]);

        // Claimed orphans stop being eligible for expiry.
        storage.claim_orphan(&id);
        assert_eq!(storage.num_orphans(), 0);
        assert_eq!(
            storage.periodic_cleanup(1_000 + DSPROOF_ORPHAN_KEEP_SECONDS + 1),
            0
        );
        assert!(storage.exists(&id));

        storage.orphan_existing(&id, 2_000);
        assert_eq!(storage.num_orphans(), 1);
        assert_eq!(
            storage.periodic_cleanup(2_000 + DSPROOF_ORPHAN_KEEP_SECONDS + 1),
            1
        );
        assert!(!storage.exists(&id));
    }

    #[test]
    fn re_adding_an_orphan_claims_it() {
        let (tx1, tx2, prevout) = conflicting_pair();
        let proof = DoubleSpendProof::create(&tx1, &tx2, &prevout).expect("proof");
        let id = proof.dsp_id();

        let mut storage = DoubleSpendProofStorage::new();
        storage.add_orphan(proof.clone(), 10);
        assert!(!storage.add(proof, 20));
        assert_eq!(storage.num_orphans(), 0);
        assert_eq!(storage.is_orphan(&id), Some(false));
    }
}
