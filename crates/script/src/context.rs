//! Per-transaction execution context shared by all input checks.
//!
//! Built once per transaction: every input's coin is resolved up front and
//! the reference aggregates the specialized opcodes query are computed in
//! a single pass over inputs and outputs. After construction everything is
//! immutable and shared through an `Arc`, so per-input contexts are cheap
//! to hand to parallel checkers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use emberd_consensus::{Amount, Hash256};
use emberd_primitives::coin::{Coin, CoinView};
use emberd_primitives::encoding::Encoder;
use emberd_primitives::hash::sha256d;
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::{Transaction, TxId};

use crate::error::ScriptError;
use crate::script::{self, RefId, ScriptRefs};

/// Reference kind as reported by the `OP_REFTYPE_*` opcodes.
pub const REF_TYPE_NONE: i64 = 0;
pub const REF_TYPE_NORMAL: i64 = 1;
pub const REF_TYPE_SINGLETON: i64 = 2;

#[derive(Debug)]
pub enum ContextError {
    /// An input spends an outpoint the coin view cannot resolve.
    MissingInput(OutPoint),
    /// The requested input index does not exist in the transaction.
    InputIndexOutOfRange(usize),
    /// A reference declaration in an input or output script is malformed.
    BadRefEncoding(ScriptError),
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextError::MissingInput(outpoint) => {
                write!(f, "missing coin for input {outpoint}")
            }
            ContextError::InputIndexOutOfRange(index) => {
                write!(f, "input index {index} out of range")
            }
            ContextError::BadRefEncoding(err) => write!(f, "bad reference encoding: {err}"),
        }
    }
}

impl std::error::Error for ContextError {}

/// Aggregates over one side of the transaction (all input coins, or all
/// outputs), keyed by reference id, reference hash, and code-script hash.
#[derive(Debug, Default)]
struct RefAggregates {
    value_sum: HashMap<RefId, Amount>,
    output_count: HashMap<RefId, i64>,
    zero_valued_count: HashMap<RefId, i64>,
    ref_type: HashMap<RefId, i64>,
    hash_value_sum: HashMap<Hash256, Amount>,
    code_script_value_sum: HashMap<Hash256, Amount>,
    code_script_count: HashMap<Hash256, i64>,
    code_script_zero_valued_count: HashMap<Hash256, i64>,
}

impl RefAggregates {
    fn accumulate(&mut self, refs: &ScriptRefs, script: &[u8], value: Amount) {
        let distinct: BTreeSet<&RefId> = refs.all_pushed().collect();
        for id in distinct {
            *self.value_sum.entry(*id).or_default() += value;
            *self.output_count.entry(*id).or_default() += 1;
            if value == 0 {
                *self.zero_valued_count.entry(*id).or_default() += 1;
            }
            *self.hash_value_sum.entry(ref_hash(id)).or_default() += value;
            let kind = if refs.singleton_refs.contains(id) {
                REF_TYPE_SINGLETON
            } else {
                REF_TYPE_NORMAL
            };
            let entry = self.ref_type.entry(*id).or_insert(REF_TYPE_NONE);
            *entry = (*entry).max(kind);
        }

        let code_hash = sha256d(script::code_script(script));
        *self.code_script_value_sum.entry(code_hash).or_default() += value;
        *self.code_script_count.entry(code_hash).or_default() += 1;
        if value == 0 {
            *self.code_script_zero_valued_count.entry(code_hash).or_default() += 1;
        }
    }
}

/// Per-script precomputation used by the unary summary opcodes.
#[derive(Debug)]
struct ScriptView {
    refs: ScriptRefs,
    /// Byte offset just past the first top-level state separator, 0 if none.
    separator_offset: usize,
    /// Distinct refs, sorted and concatenated; empty when the script has none.
    ref_concat: Vec<u8>,
    /// hash256 of value, script hash, ref count, and the ref concat hash.
    data_summary: Hash256,
}

impl ScriptView {
    fn build(script: &[u8], value: Amount) -> Result<Self, ContextError> {
        let refs = script::extract_refs(script).map_err(ContextError::BadRefEncoding)?;
        let distinct: BTreeSet<&RefId> = refs.all_pushed().collect();
        let mut ref_concat = Vec::with_capacity(distinct.len() * 36);
        for id in &distinct {
            ref_concat.extend_from_slice(&id[..]);
        }

        let mut enc = Encoder::new();
        enc.write_i64_le(value);
        enc.write_hash_le(&sha256d(script));
        enc.write_varint(distinct.len() as u64);
        enc.write_hash_le(&sha256d(&ref_concat));
        let data_summary = sha256d(&enc.into_inner());

        Ok(Self {
            separator_offset: script::state_separator_offset(script),
            refs,
            ref_concat,
            data_summary,
        })
    }
}

#[derive(Debug)]
pub struct SharedContext {
    tx: Arc<Transaction>,
    txid: TxId,
    limited: bool,
    /// One slot per input; a limited context only populates its own.
    input_coins: Vec<Option<Coin>>,
    input_views: Vec<Option<ScriptView>>,
    output_views: Vec<ScriptView>,
    utxo_aggregates: RefAggregates,
    output_aggregates: RefAggregates,
}

impl SharedContext {
    fn build(
        tx: Arc<Transaction>,
        input_coins: Vec<Option<Coin>>,
        limited: bool,
    ) -> Result<Self, ContextError> {
        debug_assert_eq!(input_coins.len(), tx.vin.len());

        let mut utxo_aggregates = RefAggregates::default();
        let mut input_views = Vec::with_capacity(input_coins.len());
        for coin in &input_coins {
            match coin {
                Some(coin) => {
                    let view = ScriptView::build(&coin.output.script_pubkey, coin.amount())?;
                    utxo_aggregates.accumulate(
                        &view.refs,
                        &coin.output.script_pubkey,
                        coin.amount(),
                    );
                    input_views.push(Some(view));
                }
                None => input_views.push(None),
            }
        }

        let mut output_aggregates = RefAggregates::default();
        let mut output_views = Vec::with_capacity(tx.vout.len());
        for output in &tx.vout {
            let view = ScriptView::build(&output.script_pubkey, output.value)?;
            output_aggregates.accumulate(&view.refs, &output.script_pubkey, output.value);
            output_views.push(view);
        }

        let txid = tx.txid();
        Ok(Self {
            tx,
            txid,
            limited,
            input_coins,
            input_views,
            output_views,
            utxo_aggregates,
            output_aggregates,
        })
    }
}

/// One input's view of a transaction under validation.
#[derive(Clone, Debug)]
pub struct ScriptExecutionContext {
    input_index: usize,
    shared: Arc<SharedContext>,
}

impl ScriptExecutionContext {
    /// Builds one context per input, all sharing one precomputed block.
    /// Fails if any input's coin cannot be resolved or any reference
    /// declaration in the scripts involved is malformed.
    pub fn create_for_all_inputs(
        tx: Arc<Transaction>,
        coins: &impl CoinView,
    ) -> Result<Vec<Self>, ContextError> {
        let mut input_coins = Vec::with_capacity(tx.vin.len());
        for input in &tx.vin {
            let coin = coins
                .get_coin(&input.prevout)
                .ok_or_else(|| ContextError::MissingInput(input.prevout.clone()))?;
            input_coins.push(Some(coin));
        }
        let shared = Arc::new(SharedContext::build(tx, input_coins, false)?);
        Ok((0..shared.tx.vin.len())
            .map(|input_index| Self {
                input_index,
                shared: Arc::clone(&shared),
            })
            .collect())
    }

    /// A single-input context with no sibling coins. Introspection of any
    /// other input fails with `LimitedContextNoSiblingInfo`.
    pub fn limited(
        input_index: usize,
        coin: Coin,
        tx: Arc<Transaction>,
    ) -> Result<Self, ContextError> {
        if input_index >= tx.vin.len() {
            return Err(ContextError::InputIndexOutOfRange(input_index));
        }
        let mut input_coins = vec![None; tx.vin.len()];
        input_coins[input_index] = Some(coin);
        let shared = Arc::new(SharedContext::build(tx, input_coins, true)?);
        Ok(Self {
            input_index,
            shared,
        })
    }

    pub fn input_index(&self) -> usize {
        self.input_index
    }

    pub fn is_limited(&self) -> bool {
        self.shared.limited
    }

    pub fn tx(&self) -> &Transaction {
        &self.shared.tx
    }

    pub fn shared_tx(&self) -> Arc<Transaction> {
        Arc::clone(&self.shared.tx)
    }

    pub fn txid(&self) -> &TxId {
        &self.shared.txid
    }

    pub fn coin(&self, index: usize) -> Option<&Coin> {
        self.shared.input_coins.get(index)?.as_ref()
    }

    pub fn coin_amount(&self, index: usize) -> Option<Amount> {
        self.coin(index).map(Coin::amount)
    }

    pub fn coin_script_pubkey(&self, index: usize) -> Option<&[u8]> {
        self.coin(index).map(|coin| coin.output.script_pubkey.as_slice())
    }

    pub fn script_sig(&self, index: usize) -> Option<&[u8]> {
        self.shared
            .tx
            .vin
            .get(index)
            .map(|input| input.script_sig.as_slice())
    }

    /// Sum of the input coin values. `None` on a limited context, which
    /// does not know its sibling amounts.
    pub fn total_input_value(&self) -> Option<Amount> {
        let mut total = 0;
        for coin in &self.shared.input_coins {
            total += coin.as_ref()?.amount();
        }
        Some(total)
    }

    pub fn total_output_value(&self) -> Amount {
        self.shared.tx.value_out()
    }

    pub fn input_refs(&self, index: usize) -> Option<&ScriptRefs> {
        self.shared
            .input_views
            .get(index)?
            .as_ref()
            .map(|view| &view.refs)
    }

    pub fn output_refs(&self, index: usize) -> Option<&ScriptRefs> {
        self.shared.output_views.get(index).map(|view| &view.refs)
    }

    pub fn separator_offset_utxo(&self, index: usize) -> Option<usize> {
        self.shared
            .input_views
            .get(index)?
            .as_ref()
            .map(|view| view.separator_offset)
    }

    pub fn separator_offset_output(&self, index: usize) -> Option<usize> {
        self.shared
            .output_views
            .get(index)
            .map(|view| view.separator_offset)
    }

    pub fn ref_concat_utxo(&self, index: usize) -> Option<&[u8]> {
        self.shared
            .input_views
            .get(index)?
            .as_ref()
            .map(|view| view.ref_concat.as_slice())
    }

    pub fn ref_concat_output(&self, index: usize) -> Option<&[u8]> {
        self.shared
            .output_views
            .get(index)
            .map(|view| view.ref_concat.as_slice())
    }

    pub fn data_summary_utxo(&self, index: usize) -> Option<&Hash256> {
        self.shared
            .input_views
            .get(index)?
            .as_ref()
            .map(|view| &view.data_summary)
    }

    pub fn data_summary_output(&self, index: usize) -> Option<&Hash256> {
        self.shared
            .output_views
            .get(index)
            .map(|view| &view.data_summary)
    }

    pub fn ref_value_sum_utxos(&self, id: &RefId) -> Amount {
        self.shared
            .utxo_aggregates
            .value_sum
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn ref_value_sum_outputs(&self, id: &RefId) -> Amount {
        self.shared
            .output_aggregates
            .value_sum
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn ref_output_count_utxos(&self, id: &RefId) -> i64 {
        self.shared
            .utxo_aggregates
            .output_count
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn ref_output_count_outputs(&self, id: &RefId) -> i64 {
        self.shared
            .output_aggregates
            .output_count
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn ref_zero_valued_count_utxos(&self, id: &RefId) -> i64 {
        self.shared
            .utxo_aggregates
            .zero_valued_count
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn ref_zero_valued_count_outputs(&self, id: &RefId) -> i64 {
        self.shared
            .output_aggregates
            .zero_valued_count
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn ref_type_utxo(&self, id: &RefId) -> i64 {
        self.shared
            .utxo_aggregates
            .ref_type
            .get(id)
            .copied()
            .unwrap_or(REF_TYPE_NONE)
    }

    pub fn ref_type_output(&self, id: &RefId) -> i64 {
        self.shared
            .output_aggregates
            .ref_type
            .get(id)
            .copied()
            .unwrap_or(REF_TYPE_NONE)
    }

    pub fn ref_hash_value_sum_utxos(&self, hash: &Hash256) -> Amount {
        self.shared
            .utxo_aggregates
            .hash_value_sum
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn ref_hash_value_sum_outputs(&self, hash: &Hash256) -> Amount {
        self.shared
            .output_aggregates
            .hash_value_sum
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn code_script_value_sum_utxos(&self, hash: &Hash256) -> Amount {
        self.shared
            .utxo_aggregates
            .code_script_value_sum
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn code_script_value_sum_outputs(&self, hash: &Hash256) -> Amount {
        self.shared
            .output_aggregates
            .code_script_value_sum
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn code_script_count_utxos(&self, hash: &Hash256) -> i64 {
        self.shared
            .utxo_aggregates
            .code_script_count
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn code_script_count_outputs(&self, hash: &Hash256) -> i64 {
        self.shared
            .output_aggregates
            .code_script_count
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn code_script_zero_valued_count_utxos(&self, hash: &Hash256) -> i64 {
        self.shared
            .utxo_aggregates
            .code_script_zero_valued_count
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn code_script_zero_valued_count_outputs(&self, hash: &Hash256) -> i64 {
        self.shared
            .output_aggregates
            .code_script_zero_valued_count
            .get(hash)
            .copied()
            .unwrap_or(0)
    }
}

/// Hash a reference id for the `OP_REFHASH*` opcodes.
pub fn ref_hash(id: &RefId) -> Hash256 {
    sha256d(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::transaction::{TxIn, TxOut};
    use std::collections::HashMap as StdHashMap;

    fn two_input_tx() -> (Arc<Transaction>, StdHashMap<OutPoint, Coin>) {
        let prev_a = OutPoint::new([1u8; 32], 0);
        let prev_b = OutPoint::new([2u8; 32], 1);
        let tx = Arc::new(Transaction {
            version: 1,
            vin: vec![
                TxIn::new(prev_a.clone(), vec![0x51], 0xffff_ffff),
                TxIn::new(prev_b.clone(), vec![0x52], 0xffff_ffff),
            ],
            vout: vec![TxOut::new(1_500, vec![0x51])],
            lock_time: 0,
        });
        let mut coins = StdHashMap::new();
        coins.insert(prev_a, Coin::new(TxOut::new(1_000, vec![0x51]), 10, false));
        coins.insert(prev_b, Coin::new(TxOut::new(2_000, vec![0x52]), 11, false));
        (tx, coins)
    }

    #[test]
    fn one_context_per_input() {
        let (tx, coins) = two_input_tx();
        let contexts = ScriptExecutionContext::create_for_all_inputs(tx, &coins).expect("create");
        assert_eq!(contexts.len(), 2);
        for (i, ctx) in contexts.iter().enumerate() {
            assert_eq!(ctx.input_index(), i);
            assert!(!ctx.is_limited());
        }
        assert_eq!(contexts[0].coin_amount(1), Some(2_000));
        assert_eq!(contexts[0].total_input_value(), Some(3_000));
    }

    #[test]
    fn missing_coin_fails_construction() {
        let (tx, mut coins) = two_input_tx();
        coins.remove(&tx.vin[1].prevout);
        let err = ScriptExecutionContext::create_for_all_inputs(tx, &coins).unwrap_err();
        assert!(matches!(err, ContextError::MissingInput(_)));
    }

    #[test]
    fn limited_context_knows_only_its_own_coin() {
        let (tx, coins) = two_input_tx();
        let own = coins.get(&tx.vin[0].prevout).cloned().unwrap();
        let ctx = ScriptExecutionContext::limited(0, own, tx).expect("limited");
        assert!(ctx.is_limited());
        assert_eq!(ctx.coin_amount(0), Some(1_000));
        assert_eq!(ctx.coin_amount(1), None);
        assert_eq!(ctx.total_input_value(), None);
    }

    #[test]
    fn limited_context_rejects_bad_input_index() {
        let (tx, coins) = two_input_tx();
        let own = coins.get(&tx.vin[0].prevout).cloned().unwrap();
        let err = ScriptExecutionContext::limited(2, own, tx).unwrap_err();
        assert!(matches!(err, ContextError::InputIndexOutOfRange(2)));
    }

    #[test]
    fn ref_aggregates_cover_outputs() {
        let id: RefId = [0x07; 36];
        let mut script = vec![crate::script::OP_PUSHINPUTREF];
        script.extend_from_slice(&id);
        let prev = OutPoint::new([3u8; 32], 0);
        let tx = Arc::new(Transaction {
            version: 1,
            vin: vec![TxIn::new(prev.clone(), Vec::new(), 0xffff_ffff)],
            vout: vec![
                TxOut::new(700, script.clone()),
                TxOut::new(0, script.clone()),
                TxOut::new(300, vec![0x51]),
            ],
            lock_time: 0,
        });
        let mut coins = StdHashMap::new();
        coins.insert(prev, Coin::new(TxOut::new(1_000, script), 5, false));

        let contexts = ScriptExecutionContext::create_for_all_inputs(tx, &coins).expect("create");
        let ctx = &contexts[0];
        assert_eq!(ctx.ref_value_sum_outputs(&id), 700);
        assert_eq!(ctx.ref_output_count_outputs(&id), 2);
        assert_eq!(ctx.ref_zero_valued_count_outputs(&id), 1);
        assert_eq!(ctx.ref_value_sum_utxos(&id), 1_000);
        assert_eq!(ctx.ref_type_utxo(&id), REF_TYPE_NORMAL);
        assert_eq!(ctx.ref_type_output(&[0x08; 36]), REF_TYPE_NONE);
        assert_eq!(ctx.ref_hash_value_sum_outputs(&ref_hash(&id)), 700);
    }
}
