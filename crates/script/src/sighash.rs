//! Signature hashing.
//!
//! Two algorithms: the original one that serializes a modified copy of
//! the transaction, and the fork-id digest that commits to the spent
//! amount and uses cached prevout/sequence/output hashes. The fork-id
//! path is the one consensus uses once `SCRIPT_ENABLE_SIGHASH_FORKID`
//! is active.

use emberd_consensus::{Amount, Hash256};
use emberd_primitives::encoding::{Encodable, Encoder};
use emberd_primitives::hash::sha256d;
use emberd_primitives::transaction::Transaction;

use crate::script::{next_op, OP_CODESEPARATOR};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_fork_id(self) -> bool {
        (self.0 & SIGHASH_FORKID) != 0
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    pub fn is_defined(self) -> bool {
        matches!(
            self.0 & !(SIGHASH_FORKID | SIGHASH_ANYONECANPAY),
            SIGHASH_ALL | SIGHASH_NONE | SIGHASH_SINGLE
        )
    }
}

/// Prevout/sequence/output hashes shared by every input's fork-id digest.
#[derive(Clone, Debug)]
pub struct PrecomputedSighash {
    pub hash_prevouts: Hash256,
    pub hash_sequence: Hash256,
    pub hash_outputs: Hash256,
}

impl PrecomputedSighash {
    pub fn new(tx: &Transaction) -> Self {
        let mut prevouts = Encoder::new();
        let mut sequences = Encoder::new();
        for input in &tx.vin {
            input.prevout.consensus_encode(&mut prevouts);
            sequences.write_u32_le(input.sequence);
        }
        let mut outputs = Encoder::new();
        for output in &tx.vout {
            output.consensus_encode(&mut outputs);
        }
        Self {
            hash_prevouts: sha256d(&prevouts.into_inner()),
            hash_sequence: sha256d(&sequences.into_inner()),
            hash_outputs: sha256d(&outputs.into_inner()),
        }
    }
}

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Amount,
    sighash_type: SighashType,
    cache: Option<&PrecomputedSighash>,
) -> Hash256 {
    if sighash_type.has_fork_id() {
        signature_hash_fork_id(tx, input_index, script_code, amount, sighash_type, cache)
    } else {
        signature_hash_legacy(tx, input_index, script_code, sighash_type)
    }
}

fn signature_hash_fork_id(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Amount,
    sighash_type: SighashType,
    cache: Option<&PrecomputedSighash>,
) -> Hash256 {
    let computed;
    let cache = match cache {
        Some(cache) => cache,
        None => {
            computed = PrecomputedSighash::new(tx);
            &computed
        }
    };

    let base = sighash_type.base_type();
    let zero = [0u8; 32];

    let hash_prevouts = if sighash_type.has_anyone_can_pay() {
        &zero
    } else {
        &cache.hash_prevouts
    };
    let hash_sequence = if sighash_type.has_anyone_can_pay()
        || base == SIGHASH_SINGLE
        || base == SIGHASH_NONE
    {
        &zero
    } else {
        &cache.hash_sequence
    };
    let single_output;
    let hash_outputs = if base == SIGHASH_SINGLE {
        if input_index < tx.vout.len() {
            let mut enc = Encoder::new();
            tx.vout[input_index].consensus_encode(&mut enc);
            single_output = sha256d(&enc.into_inner());
            &single_output
        } else {
            &zero
        }
    } else if base == SIGHASH_NONE {
        &zero
    } else {
        &cache.hash_outputs
    };

    let input = &tx.vin[input_index];
    let mut enc = Encoder::new();
    enc.write_i32_le(tx.version);
    enc.write_hash_le(hash_prevouts);
    enc.write_hash_le(hash_sequence);
    input.prevout.consensus_encode(&mut enc);
    enc.write_var_bytes(script_code);
    enc.write_i64_le(amount);
    enc.write_u32_le(input.sequence);
    enc.write_hash_le(hash_outputs);
    enc.write_u32_le(tx.lock_time);
    enc.write_u32_le(sighash_type.0);
    sha256d(&enc.into_inner())
}

fn signature_hash_legacy(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Hash256 {
    let one_hash = {
        let mut hash = [0u8; 32];
        hash[0] = 1;
        hash
    };
    if input_index >= tx.vin.len() {
        return one_hash;
    }
    let base = sighash_type.base_type();
    if base == SIGHASH_SINGLE && input_index >= tx.vout.len() {
        return one_hash;
    }

    let script_code = strip_code_separators(script_code);

    let mut copy = tx.clone();
    for input in &mut copy.vin {
        input.script_sig = Vec::new();
    }
    copy.vin[input_index].script_sig = script_code;

    match base {
        SIGHASH_NONE => {
            copy.vout.clear();
            for (i, input) in copy.vin.iter_mut().enumerate() {
                if i != input_index {
                    input.sequence = 0;
                }
            }
        }
        SIGHASH_SINGLE => {
            copy.vout.truncate(input_index + 1);
            for output in copy.vout.iter_mut().take(input_index) {
                output.value = -1;
                output.script_pubkey = Vec::new();
            }
            for (i, input) in copy.vin.iter_mut().enumerate() {
                if i != input_index {
                    input.sequence = 0;
                }
            }
        }
        _ => {}
    }

    if sighash_type.has_anyone_can_pay() {
        let only = copy.vin.swap_remove(input_index);
        copy.vin = vec![only];
    }

    let mut enc = Encoder::new();
    copy.consensus_encode(&mut enc);
    enc.write_u32_le(sighash_type.0);
    sha256d(&enc.into_inner())
}

fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut cursor = 0usize;
    while cursor < script.len() {
        let start = cursor;
        match next_op(script, &mut cursor) {
            Ok(op) if op.opcode == OP_CODESEPARATOR => {}
            Ok(_) => out.extend_from_slice(&script[start..cursor]),
            Err(_) => {
                // A malformed tail serializes unchanged.
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{TxIn, TxOut};

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![
                TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x51], 0xffff_ffff),
                TxIn::new(OutPoint::new([2u8; 32], 1), vec![0x52], 0xffff_fffe),
            ],
            vout: vec![TxOut::new(900, vec![0x51]), TxOut::new(100, vec![0x52])],
            lock_time: 17,
        }
    }

    #[test]
    fn fork_id_digest_differs_per_input() {
        let tx = sample_tx();
        let cache = PrecomputedSighash::new(&tx);
        let ty = SighashType(SIGHASH_ALL | SIGHASH_FORKID);
        let a = signature_hash(&tx, 0, &[0x51], 1_000, ty, Some(&cache));
        let b = signature_hash(&tx, 1, &[0x51], 1_000, ty, Some(&cache));
        assert_ne!(a, b);
        assert_eq!(a, signature_hash(&tx, 0, &[0x51], 1_000, ty, None));
    }

    #[test]
    fn fork_id_commits_to_amount() {
        let tx = sample_tx();
        let ty = SighashType(SIGHASH_ALL | SIGHASH_FORKID);
        let a = signature_hash(&tx, 0, &[0x51], 1_000, ty, None);
        let b = signature_hash(&tx, 0, &[0x51], 1_001, ty, None);
        assert_ne!(a, b);
    }

    #[test]
    fn legacy_single_out_of_range_is_one() {
        let mut tx = sample_tx();
        tx.vout.truncate(1);
        let hash = signature_hash(&tx, 1, &[0x51], 0, SighashType(SIGHASH_SINGLE), None);
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(hash, one);
    }

    #[test]
    fn code_separators_are_stripped() {
        assert_eq!(
            strip_code_separators(&[0x51, OP_CODESEPARATOR, 0x52]),
            vec![0x51, 0x52]
        );
    }
}
