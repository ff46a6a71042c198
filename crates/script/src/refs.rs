//! Transaction-wide reference induction rule.
//!
//! Evaluated once per transaction, not per input: every reference an
//! output pushes, requires, or claims as a singleton must be available
//! from the inputs, either as an id minted from a spent outpoint or as a
//! reference carried in a spent coin's script. A disallow-sibling
//! declaration pins a reference to the single output that declares it.

use std::collections::{BTreeSet, HashMap};

use emberd_primitives::encoding::Encoder;
use emberd_primitives::outpoint::OutPoint;

use crate::context::ScriptExecutionContext;
use crate::error::ScriptError;
use crate::script::RefId;

/// The reference id minted by spending `outpoint`: its serialized form.
pub fn outpoint_ref_id(outpoint: &OutPoint) -> RefId {
    let mut enc = Encoder::new();
    enc.write_hash_le(&outpoint.hash);
    enc.write_u32_le(outpoint.index);
    let bytes = enc.into_inner();
    bytes.try_into().expect("outpoint serializes to 36 bytes")
}

/// Checks the induction rule over a full (non-limited) context.
pub fn validate_reference_operations(
    context: &ScriptExecutionContext,
) -> Result<(), ScriptError> {
    let tx = context.tx();

    let mut output_push: BTreeSet<RefId> = BTreeSet::new();
    let mut output_require: BTreeSet<RefId> = BTreeSet::new();
    let mut output_singleton: BTreeSet<RefId> = BTreeSet::new();
    // Ref pinned by a disallow-sibling declaration, and the only output
    // index it may appear in.
    let mut only_allowed: HashMap<RefId, usize> = HashMap::new();
    let mut per_output_push: Vec<BTreeSet<RefId>> = Vec::with_capacity(tx.vout.len());

    for index in 0..tx.vout.len() {
        let refs = context
            .output_refs(index)
            .ok_or(ScriptError::InvalidTxOutputIndex)?;
        for id in &refs.disallowed_sibling_refs {
            if only_allowed.insert(*id, index).is_some() {
                // The same pin in two outputs is contradictory.
                return Err(ScriptError::DisallowedSiblingRef);
            }
        }
        let local: BTreeSet<RefId> = refs.push_refs.iter().copied().collect();
        output_push.extend(local.iter().copied());
        output_singleton.extend(refs.singleton_refs.iter().copied());
        output_require.extend(refs.require_refs.iter().copied());
        per_output_push.push(local);
    }

    if output_push.is_empty() && output_require.is_empty() && output_singleton.is_empty() {
        return Ok(());
    }

    if context.is_limited() {
        return Err(ScriptError::LimitedContextNoSiblingInfo);
    }

    let mut input_push: BTreeSet<RefId> = BTreeSet::new();
    let mut input_singleton: BTreeSet<RefId> = BTreeSet::new();
    for (index, input) in tx.vin.iter().enumerate() {
        let minted = outpoint_ref_id(&input.prevout);
        input_push.insert(minted);
        input_singleton.insert(minted);
        let refs = context
            .input_refs(index)
            .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
        input_push.extend(refs.push_refs.iter().copied());
        input_singleton.extend(refs.singleton_refs.iter().copied());
    }

    if !output_push.is_subset(&input_push) {
        return Err(ScriptError::RefMissingFromInputs);
    }
    if !output_require.is_subset(&input_push) {
        return Err(ScriptError::RequireRefMissingFromInputs);
    }
    if !output_singleton.is_subset(&input_singleton) {
        return Err(ScriptError::SingletonRefMissingFromInputs);
    }

    for (index, refs) in per_output_push.iter().enumerate() {
        for id in refs {
            if let Some(allowed) = only_allowed.get(id) {
                if *allowed != index {
                    return Err(ScriptError::DisallowedSiblingRef);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::coin::Coin;
    use emberd_primitives::transaction::{Transaction, TxIn, TxOut};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    use crate::script::{
        OP_DISALLOWPUSHINPUTREFSIBLING, OP_PUSHINPUTREF, OP_PUSHINPUTREFSINGLETON,
        OP_REQUIREINPUTREF,
    };

    fn ref_script(opcode: u8, id: &RefId) -> Vec<u8> {
        let mut script = vec![opcode];
        script.extend_from_slice(id);
        script
    }

    fn build_context(
        coin_script: Vec<u8>,
        outputs: Vec<TxOut>,
    ) -> (ScriptExecutionContext, RefId) {
        let prevout = OutPoint::new([9u8; 32], 2);
        let minted = outpoint_ref_id(&prevout);
        let tx = Arc::new(Transaction {
            version: 1,
            vin: vec![TxIn::new(prevout.clone(), Vec::new(), 0xffff_ffff)],
            vout: outputs,
            lock_time: 0,
        });
        let mut coins = StdHashMap::new();
        coins.insert(prevout, Coin::new(TxOut::new(5_000, coin_script), 1, false));
        let contexts =
            ScriptExecutionContext::create_for_all_inputs(tx, &coins).expect("context");
        (contexts.into_iter().next().unwrap(), minted)
    }

    #[test]
    fn carried_forward_ref_is_allowed() {
        let id: RefId = [0x21; 36];
        let (ctx, _) = build_context(
            ref_script(OP_PUSHINPUTREF, &id),
            vec![TxOut::new(100, ref_script(OP_PUSHINPUTREF, &id))],
        );
        assert_eq!(validate_reference_operations(&ctx), Ok(()));
    }

    #[test]
    fn outpoint_minted_ref_is_allowed() {
        // build_context always spends [9; 32]:2, so its minted id is known up front.
        let minted = outpoint_ref_id(&OutPoint::new([9u8; 32], 2));
        let (ctx, _) = build_context(
            vec![0x51],
            vec![TxOut::new(100, ref_script(OP_PUSHINPUTREFSINGLETON, &minted))],
        );
        assert_eq!(validate_reference_operations(&ctx), Ok(()));
    }

    #[test]
    fn unsourced_refs_are_rejected_per_kind() {
        let id: RefId = [0x22; 36];
        let (ctx, _) = build_context(
            vec![0x51],
            vec![TxOut::new(100, ref_script(OP_PUSHINPUTREF, &id))],
        );
        assert_eq!(
            validate_reference_operations(&ctx),
            Err(ScriptError::RefMissingFromInputs)
        );

        let (ctx, _) = build_context(
            vec![0x51],
            vec![TxOut::new(100, ref_script(OP_REQUIREINPUTREF, &id))],
        );
        assert_eq!(
            validate_reference_operations(&ctx),
            Err(ScriptError::RequireRefMissingFromInputs)
        );

        // A plain push in the coin script does not satisfy a singleton claim.
        let (ctx, _) = build_context(
            ref_script(OP_PUSHINPUTREF, &id),
            vec![TxOut::new(100, ref_script(OP_PUSHINPUTREFSINGLETON, &id))],
        );
        assert_eq!(
            validate_reference_operations(&ctx),
            Err(ScriptError::SingletonRefMissingFromInputs)
        );
    }

    #[test]
    fn disallowed_sibling_pins_ref_to_one_output() {
        let id: RefId = [0x23; 36];
        let mut pinned = ref_script(OP_DISALLOWPUSHINPUTREFSIBLING, &id);
        pinned.extend_from_slice(&ref_script(OP_PUSHINPUTREF, &id));

        let (ctx, _) = build_context(
            ref_script(OP_PUSHINPUTREF, &id),
            vec![
                TxOut::new(100, pinned.clone()),
                TxOut::new(100, ref_script(OP_PUSHINPUTREF, &id)),
            ],
        );
        assert_eq!(
            validate_reference_operations(&ctx),
            Err(ScriptError::DisallowedSiblingRef)
        );

        let (ctx, _) = build_context(
            ref_script(OP_PUSHINPUTREF, &id),
            vec![TxOut::new(100, pinned), TxOut::new(100, vec![0x51])],
        );
        assert_eq!(validate_reference_operations(&ctx), Ok(()));
    }

    #[test]
    fn no_refs_short_circuits() {
        let (ctx, _) = build_context(vec![0x51], vec![TxOut::new(100, vec![0x51])]);
        assert_eq!(validate_reference_operations(&ctx), Ok(()));
    }
}
