//! Signature checkers, encoding rules, and the deferred per-input check.

use std::sync::atomic::{AtomicI64, Ordering};

use emberd_consensus::constants::LOCKTIME_THRESHOLD;
use emberd_consensus::Amount;
use emberd_primitives::hash::sha256;
use emberd_primitives::transaction::{Transaction, SEQUENCE_FINAL};
use secp256k1::{ecdsa::Signature, Message, PublicKey};

use crate::context::ScriptExecutionContext;
use crate::error::ScriptError;
use crate::interpreter::{
    verify_script, ScriptExecutionMetrics, ScriptFlags, SCRIPT_ENABLE_SIGHASH_FORKID,
    SCRIPT_VERIFY_LOW_S, SCRIPT_VERIFY_STRICTENC,
};
use crate::secp::secp256k1_verify;
use crate::sighash::{signature_hash, PrecomputedSighash, SighashType};

/// Relative lock time is disabled for an input when this bit is set.
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: i64 = 1 << 31;
/// Set when the relative lock time is measured in 512-second units
/// rather than blocks.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: i64 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: i64 = 0x0000_ffff;

/// Encoding checks raise script errors; the actual cryptographic
/// verification happens in a [`SignatureChecker`] and only answers
/// true or false.
pub fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if sig.is_empty() {
        return Ok(());
    }
    if (flags & (SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_LOW_S)) != 0 {
        let der = &sig[..sig.len() - 1];
        let parsed = Signature::from_der(der).map_err(|_| ScriptError::SigDer)?;
        check_low_s(&parsed, flags)?;
    }
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 {
        let sighash_type = SighashType(sig[sig.len() - 1] as u32);
        if !sighash_type.is_defined() {
            return Err(ScriptError::SigHashType);
        }
        let fork_id_enabled = (flags & SCRIPT_ENABLE_SIGHASH_FORKID) != 0;
        if sighash_type.has_fork_id() != fork_id_enabled {
            return Err(ScriptError::MustUseForkId);
        }
    }
    Ok(())
}

/// Data signatures carry no sighash-type byte; the whole element is DER.
pub fn check_data_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if sig.is_empty() {
        return Ok(());
    }
    if (flags & (SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_LOW_S)) != 0 {
        let parsed = Signature::from_der(sig).map_err(|_| ScriptError::SigDer)?;
        check_low_s(&parsed, flags)?;
    }
    Ok(())
}

fn check_low_s(parsed: &Signature, flags: ScriptFlags) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_LOW_S) != 0 {
        let mut normalized = *parsed;
        normalized.normalize_s();
        if normalized != *parsed {
            return Err(ScriptError::SigHighS);
        }
    }
    Ok(())
}

pub fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 && !is_valid_pubkey(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

fn is_valid_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

pub trait SignatureChecker {
    fn check_sig(&self, _sig: &[u8], _pubkey: &[u8], _script_code: &[u8]) -> bool {
        false
    }

    fn check_data_sig(&self, _sig: &[u8], _message: &[u8], _pubkey: &[u8]) -> bool {
        false
    }

    fn check_lock_time(&self, _lock_time: i64) -> bool {
        false
    }

    fn check_sequence(&self, _sequence: i64) -> bool {
        false
    }
}

/// A checker with no transaction behind it; every check fails.
pub struct BaseSignatureChecker;

impl SignatureChecker for BaseSignatureChecker {}

pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: Amount,
    cache: PrecomputedSighash,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, amount: Amount) -> Self {
        Self {
            tx,
            input_index,
            amount,
            cache: PrecomputedSighash::new(tx),
        }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        if sig.is_empty() {
            return false;
        }
        let sighash_type = SighashType(sig[sig.len() - 1] as u32);
        let Ok(mut signature) = Signature::from_der(&sig[..sig.len() - 1]) else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let digest = signature_hash(
            self.tx,
            self.input_index,
            script_code,
            self.amount,
            sighash_type,
            Some(&self.cache),
        );
        let Ok(message) = Message::from_digest_slice(&digest) else {
            return false;
        };
        signature.normalize_s();
        secp256k1_verify()
            .verify_ecdsa(&message, &signature, &pubkey)
            .is_ok()
    }

    fn check_data_sig(&self, sig: &[u8], message: &[u8], pubkey: &[u8]) -> bool {
        if sig.is_empty() {
            return false;
        }
        let Ok(mut signature) = Signature::from_der(sig) else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let digest = sha256(message);
        let Ok(message) = Message::from_digest_slice(&digest) else {
            return false;
        };
        signature.normalize_s();
        secp256k1_verify()
            .verify_ecdsa(&message, &signature, &pubkey)
            .is_ok()
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock_time = self.tx.lock_time as i64;
        let same_kind = (tx_lock_time < LOCKTIME_THRESHOLD && lock_time < LOCKTIME_THRESHOLD)
            || (tx_lock_time >= LOCKTIME_THRESHOLD && lock_time >= LOCKTIME_THRESHOLD);
        if !same_kind {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        // A final input opts out of lock-time enforcement entirely.
        self.tx.vin[self.input_index].sequence != SEQUENCE_FINAL
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let tx_sequence = self.tx.vin[self.input_index].sequence as i64;
        if self.tx.version < 2 {
            return false;
        }
        if (tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG) != 0 {
            return false;
        }
        let mask = SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK;
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        let same_kind = (tx_masked < SEQUENCE_LOCKTIME_TYPE_FLAG
            && masked < SEQUENCE_LOCKTIME_TYPE_FLAG)
            || (tx_masked >= SEQUENCE_LOCKTIME_TYPE_FLAG
                && masked >= SEQUENCE_LOCKTIME_TYPE_FLAG);
        same_kind && masked <= tx_masked
    }
}

/// One input's script validation, packaged so a worker pool can run it.
pub struct ScriptCheck {
    context: ScriptExecutionContext,
    flags: ScriptFlags,
}

impl ScriptCheck {
    pub fn new(context: ScriptExecutionContext, flags: ScriptFlags) -> Self {
        Self { context, flags }
    }

    pub fn input_index(&self) -> usize {
        self.context.input_index()
    }

    pub fn execute(&self) -> Result<ScriptExecutionMetrics, ScriptError> {
        let input_index = self.context.input_index();
        let tx = self.context.tx();
        let amount = self
            .context
            .coin_amount(input_index)
            .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
        let script_pubkey = self
            .context
            .coin_script_pubkey(input_index)
            .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
        let checker = TransactionSignatureChecker::new(tx, input_index, amount);
        verify_script(
            &tx.vin[input_index].script_sig,
            script_pubkey,
            self.flags,
            &checker,
            Some(&self.context),
        )
    }
}

/// Shared countdown of inputs left to validate synchronously.
#[derive(Debug)]
pub struct CheckInputsLimiter {
    remaining: AtomicI64,
}

impl CheckInputsLimiter {
    pub fn new(limit: i64) -> Self {
        Self {
            remaining: AtomicI64::new(limit),
        }
    }

    /// Consumes one slot; false once the limit is exhausted.
    pub fn consume_and_check(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) - 1 >= 0
    }
}

/// Shared signature-check budget for one transaction.
#[derive(Debug)]
pub struct TxSigCheckLimiter {
    remaining: AtomicI64,
}

impl TxSigCheckLimiter {
    pub fn new(limit: i64) -> Self {
        Self {
            remaining: AtomicI64::new(limit),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(i64::MAX)
    }

    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Consumes `count` sig checks; false when the budget went negative.
    pub fn consume_and_check(&self, count: i64) -> bool {
        self.remaining.fetch_sub(count, Ordering::AcqRel) - count >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{
        SCRIPT_64_BIT_INTEGERS, SCRIPT_ENHANCED_REFERENCES, SCRIPT_NATIVE_INTROSPECTION,
        SCRIPT_VERIFY_MINIMALDATA,
    };
    use crate::sighash::SIGHASH_ALL;
    use emberd_primitives::coin::Coin;
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{TxIn, TxOut};
    use secp256k1::SecretKey;
    use std::collections::HashMap;
    use std::sync::Arc;

    const OP_CHECKSIG: u8 = 0xac;

    fn spend_tx(sequence: u32, lock_time: u32, version: i32) -> Transaction {
        Transaction {
            version,
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0), Vec::new(), sequence)],
            vout: vec![TxOut::new(900, vec![0x51])],
            lock_time,
        }
    }

    #[test]
    fn lock_time_rules() {
        let tx = spend_tx(0xffff_fffe, 100, 1);
        let checker = TransactionSignatureChecker::new(&tx, 0, 1_000);
        assert!(checker.check_lock_time(99));
        assert!(checker.check_lock_time(100));
        assert!(!checker.check_lock_time(101));
        // Block heights cannot satisfy a timestamp lock.
        assert!(!checker.check_lock_time(600_000_000));

        let final_tx = spend_tx(SEQUENCE_FINAL, 100, 1);
        let checker = TransactionSignatureChecker::new(&final_tx, 0, 1_000);
        assert!(!checker.check_lock_time(99));
    }

    #[test]
    fn sequence_rules() {
        let tx = spend_tx(10, 0, 2);
        let checker = TransactionSignatureChecker::new(&tx, 0, 1_000);
        assert!(checker.check_sequence(5));
        assert!(checker.check_sequence(10));
        assert!(!checker.check_sequence(11));
        // Time-based lock against a height-based input sequence.
        assert!(!checker.check_sequence(SEQUENCE_LOCKTIME_TYPE_FLAG | 5));

        let v1 = spend_tx(10, 0, 1);
        let checker = TransactionSignatureChecker::new(&v1, 0, 1_000);
        assert!(!checker.check_sequence(5));

        let disabled = spend_tx(SEQUENCE_LOCKTIME_DISABLE_FLAG as u32 | 10, 0, 2);
        let checker = TransactionSignatureChecker::new(&disabled, 0, 1_000);
        assert!(!checker.check_sequence(5));
    }

    #[test]
    fn signature_encoding_checks() {
        assert!(check_signature_encoding(&[], SCRIPT_VERIFY_STRICTENC).is_ok());
        assert_eq!(
            check_signature_encoding(&[0x01, 0x02, 0x03], SCRIPT_VERIFY_STRICTENC).unwrap_err(),
            ScriptError::SigDer
        );
        assert_eq!(
            check_pubkey_encoding(&[0x05; 12], SCRIPT_VERIFY_STRICTENC).unwrap_err(),
            ScriptError::PubkeyType
        );
        assert!(check_pubkey_encoding(&[0x05; 12], 0).is_ok());
    }

    #[test]
    fn limiters_count_down() {
        let inputs = CheckInputsLimiter::new(2);
        assert!(inputs.consume_and_check());
        assert!(inputs.consume_and_check());
        assert!(!inputs.consume_and_check());

        let sig_checks = TxSigCheckLimiter::new(3);
        assert!(sig_checks.consume_and_check(2));
        assert!(!sig_checks.consume_and_check(2));
        assert!(TxSigCheckLimiter::unlimited().consume_and_check(1_000_000));
    }

    #[test]
    fn p2pk_spend_end_to_end() {
        let signing = secp256k1::Secp256k1::signing_only();
        let secret = SecretKey::from_slice(&[0x42; 32]).expect("secret key");
        let pubkey = PublicKey::from_secret_key(&signing, &secret);
        let pubkey_bytes = pubkey.serialize();

        let mut script_pubkey = vec![pubkey_bytes.len() as u8];
        script_pubkey.extend_from_slice(&pubkey_bytes);
        script_pubkey.push(OP_CHECKSIG);

        let prevout = OutPoint::new([7u8; 32], 1);
        let mut tx = Transaction {
            version: 2,
            vin: vec![TxIn::new(prevout.clone(), Vec::new(), 0xffff_ffff)],
            vout: vec![TxOut::new(900, vec![0x51])],
            lock_time: 0,
        };

        let amount = 1_000;
        let sighash_type = SighashType(SIGHASH_ALL | crate::sighash::SIGHASH_FORKID);
        let digest = signature_hash(&tx, 0, &script_pubkey, amount, sighash_type, None);
        let message = Message::from_digest_slice(&digest).expect("digest");
        let mut sig = signing
            .sign_ecdsa(&message, &secret)
            .serialize_der()
            .to_vec();
        sig.push(sighash_type.0 as u8);

        let mut script_sig = vec![sig.len() as u8];
        script_sig.extend_from_slice(&sig);
        tx.vin[0].script_sig = script_sig.clone();

        let tx = Arc::new(tx);
        let mut coins = HashMap::new();
        coins.insert(prevout, Coin::new(TxOut::new(amount, script_pubkey), 10, false));
        let context = ScriptExecutionContext::create_for_all_inputs(Arc::clone(&tx), &coins)
            .expect("context")
            .remove(0);

        let flags = SCRIPT_VERIFY_MINIMALDATA
            | SCRIPT_VERIFY_STRICTENC
            | SCRIPT_ENABLE_SIGHASH_FORKID
            | SCRIPT_NATIVE_INTROSPECTION
            | SCRIPT_ENHANCED_REFERENCES
            | SCRIPT_64_BIT_INTEGERS;
        let check = ScriptCheck::new(context, flags);
        let metrics = check.execute().expect("valid spend");
        assert_eq!(metrics.sig_checks, 1);
    }
}
