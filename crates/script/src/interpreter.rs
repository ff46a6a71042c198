//! Script interpreter.
//!
//! `eval_script` runs one script against a stack; `verify_script` runs the
//! unlocking and locking scripts in sequence, with the pay-to-script-hash
//! redeem path on top. The transaction-introspection and reference opcode
//! families need a [`ScriptExecutionContext`]; scripts that never use them
//! run fine without one.

use emberd_consensus::constants::{
    MAX_OPS_PER_SCRIPT, MAX_PUBKEYS_PER_MULTISIG, MAX_SCRIPT_ELEMENT_SIZE, MAX_SCRIPT_SIZE,
    MAX_STACK_SIZE,
};
use emberd_primitives::hash::{hash160, sha256, sha256d};
use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha1::Sha1;

use crate::check::{
    check_data_signature_encoding, check_pubkey_encoding, check_signature_encoding,
    SignatureChecker, SEQUENCE_LOCKTIME_DISABLE_FLAG,
};
use crate::context::ScriptExecutionContext;
use crate::error::ScriptError;
use crate::script::{self, *};
use crate::scriptnum::{
    checked_script_op, decode_script_num, encode_script_num, LEGACY_MAX_NUM_SIZE,
    WIDE_MAX_NUM_SIZE,
};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;
pub const SCRIPT_VERIFY_NULLFAIL: ScriptFlags = 1 << 14;
pub const SCRIPT_ENABLE_SIGHASH_FORKID: ScriptFlags = 1 << 16;
pub const SCRIPT_NATIVE_INTROSPECTION: ScriptFlags = 1 << 17;
pub const SCRIPT_ENHANCED_REFERENCES: ScriptFlags = 1 << 18;
pub const SCRIPT_64_BIT_INTEGERS: ScriptFlags = 1 << 19;

pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_ENABLE_SIGHASH_FORKID
    | SCRIPT_NATIVE_INTROSPECTION
    | SCRIPT_ENHANCED_REFERENCES
    | SCRIPT_64_BIT_INTEGERS;
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_SIGPUSHONLY
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_NULLFAIL;

/// Counters accumulated over one script run. Sig checks feed the
/// per-transaction and per-block signature budgets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScriptExecutionMetrics {
    pub sig_checks: i64,
}

pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
    context: Option<&ScriptExecutionContext>,
) -> Result<ScriptExecutionMetrics, ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut metrics = ScriptExecutionMetrics::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(script_sig, &mut stack, flags, checker, context, &mut metrics)?;

    let stack_copy = if (flags & SCRIPT_VERIFY_P2SH) != 0 {
        Some(stack.clone())
    } else {
        None
    };

    eval_script(script_pubkey, &mut stack, flags, checker, context, &mut metrics)?;
    match stack.last() {
        Some(top) if cast_to_bool(top) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        // stack_copy mirrors the scriptSig result and cannot be empty here.
        let mut redeem_stack = stack_copy.unwrap_or_default();
        let redeem_script = redeem_stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
        stack = redeem_stack;
        eval_script(&redeem_script, &mut stack, flags, checker, context, &mut metrics)?;
        match stack.last() {
            Some(top) if cast_to_bool(top) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    Ok(metrics)
}

pub fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
    context: Option<&ScriptExecutionContext>,
    metrics: &mut ScriptExecutionMetrics,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let require_minimal = (flags & SCRIPT_VERIFY_MINIMALDATA) != 0;
    let max_num_size = if (flags & SCRIPT_64_BIT_INTEGERS) != 0 {
        WIDE_MAX_NUM_SIZE
    } else {
        LEGACY_MAX_NUM_SIZE
    };

    let mut altstack: Vec<Vec<u8>> = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut cursor = 0usize;
    let mut script_code_start = 0usize;
    let mut op_count = 0usize;

    while cursor < script.len() {
        let op = next_op(script, &mut cursor)?;
        let opcode = op.opcode;

        if let Some(data) = op.push {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if matches!(
            opcode,
            OP_INVERT | OP_2MUL | OP_2DIV | OP_MUL | OP_LSHIFT | OP_RSHIFT
        ) {
            // Disabled whether executed or not.
            return Err(ScriptError::DisabledOpcode);
        }

        let exec = exec_stack.iter().all(|v| *v);
        if !exec
            && !matches!(
                opcode,
                OP_IF | OP_NOTIF | OP_ELSE | OP_ENDIF | OP_VERIF | OP_VERNOTIF
            )
        {
            continue;
        }

        match opcode {
            OP_0 => stack.push(Vec::new()),
            0x01..=0x4b | OP_PUSHDATA1 | OP_PUSHDATA2 | OP_PUSHDATA4 => {
                let data = op.push.ok_or(ScriptError::BadOpcode)?;
                if require_minimal && !check_minimal_push(data, opcode) {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data.to_vec());
            }
            OP_1NEGATE => stack.push(encode_script_num(-1)),
            OP_1..=OP_16 => {
                stack.push(encode_script_num((opcode - OP_1 + 1) as i64));
            }

            OP_NOP => {}
            OP_VER | OP_RESERVED | OP_RESERVED1 | OP_RESERVED2 | OP_RESERVED3 | OP_RESERVED4 => {
                return Err(ScriptError::BadOpcode);
            }
            OP_VERIF | OP_VERNOTIF => return Err(ScriptError::BadOpcode),
            OP_IF | OP_NOTIF => {
                let mut branch = false;
                if exec {
                    let top = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                    branch = cast_to_bool(&top);
                    if opcode == OP_NOTIF {
                        branch = !branch;
                    }
                }
                exec_stack.push(branch);
            }
            OP_ELSE => {
                let last = exec_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
            }
            OP_ENDIF => {
                exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }
            OP_VERIFY => {
                let value = pop(stack)?;
                if !cast_to_bool(&value) {
                    return Err(ScriptError::Verify);
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),

            OP_TOALTSTACK => altstack.push(pop(stack)?),
            OP_FROMALTSTACK => {
                stack.push(altstack.pop().ok_or(ScriptError::InvalidAltstackOperation)?);
            }
            OP_2DROP => {
                pop(stack)?;
                pop(stack)?;
            }
            OP_2DUP => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.push(stack[len - 2].clone());
                stack.push(stack[len - 1].clone());
            }
            OP_3DUP => {
                let len = stack.len();
                if len < 3 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.push(stack[len - 3].clone());
                stack.push(stack[len - 2].clone());
                stack.push(stack[len - 1].clone());
            }
            OP_2OVER => {
                let len = stack.len();
                if len < 4 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.push(stack[len - 4].clone());
                stack.push(stack[len - 3].clone());
            }
            OP_2ROT => {
                let len = stack.len();
                if len < 6 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let a = stack.remove(len - 6);
                let b = stack.remove(len - 6);
                stack.push(a);
                stack.push(b);
            }
            OP_2SWAP => {
                let len = stack.len();
                if len < 4 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.swap(len - 4, len - 2);
                stack.swap(len - 3, len - 1);
            }
            OP_IFDUP => {
                let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                if cast_to_bool(top) {
                    stack.push(top.clone());
                }
            }
            OP_DEPTH => stack.push(encode_script_num(stack.len() as i64)),
            OP_DROP => {
                pop(stack)?;
            }
            OP_DUP => {
                let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?.clone();
                stack.push(top);
            }
            OP_NIP => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.remove(len - 2);
            }
            OP_OVER => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.push(stack[len - 2].clone());
            }
            OP_PICK | OP_ROLL => {
                let n = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                if n < 0 || n as usize >= stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let index = stack.len() - 1 - n as usize;
                if opcode == OP_ROLL {
                    let item = stack.remove(index);
                    stack.push(item);
                } else {
                    stack.push(stack[index].clone());
                }
            }
            OP_ROT => {
                let len = stack.len();
                if len < 3 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let item = stack.remove(len - 3);
                stack.push(item);
            }
            OP_SWAP => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.swap(len - 2, len - 1);
            }
            OP_TUCK => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let top = stack[len - 1].clone();
                stack.insert(len - 2, top);
            }

            OP_CAT => {
                let tail = pop(stack)?;
                let head = stack.last_mut().ok_or(ScriptError::InvalidStackOperation)?;
                if head.len() + tail.len() > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                head.extend_from_slice(&tail);
            }
            OP_SPLIT => {
                let position = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                let data = pop(stack)?;
                if position < 0 || position as usize > data.len() {
                    return Err(ScriptError::InvalidSplitRange);
                }
                let position = position as usize;
                stack.push(data[..position].to_vec());
                stack.push(data[position..].to_vec());
            }
            OP_NUM2BIN => {
                let size = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                if size < 0 || size as usize > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                let size = size as usize;
                let mut raw = minimal_num_bytes(pop(stack)?);
                if raw.len() > size {
                    return Err(ScriptError::ImpossibleEncoding);
                }
                if raw.len() < size {
                    let sign = match raw.last_mut() {
                        Some(last) => {
                            let sign = *last & 0x80;
                            *last &= 0x7f;
                            sign
                        }
                        None => 0,
                    };
                    raw.resize(size, 0);
                    // resize made the slot; size > 0 here.
                    *raw.last_mut().ok_or(ScriptError::ImpossibleEncoding)? = sign;
                }
                stack.push(raw);
            }
            OP_BIN2NUM => {
                let raw = minimal_num_bytes(pop(stack)?);
                if raw.len() > max_num_size {
                    return Err(ScriptError::InvalidNumberRange);
                }
                stack.push(raw);
            }
            OP_SIZE => {
                let len = stack.last().ok_or(ScriptError::InvalidStackOperation)?.len();
                stack.push(encode_script_num(len as i64));
            }
            OP_REVERSEBYTES => {
                let top = stack.last_mut().ok_or(ScriptError::InvalidStackOperation)?;
                top.reverse();
            }

            OP_AND | OP_OR | OP_XOR => {
                let rhs = pop(stack)?;
                let lhs = stack.last_mut().ok_or(ScriptError::InvalidStackOperation)?;
                if lhs.len() != rhs.len() {
                    return Err(ScriptError::InvalidOperandSize);
                }
                for (a, b) in lhs.iter_mut().zip(rhs.iter()) {
                    match opcode {
                        OP_AND => *a &= b,
                        OP_OR => *a |= b,
                        _ => *a ^= b,
                    }
                }
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                let equal = a == b;
                if opcode == OP_EQUALVERIFY {
                    if !equal {
                        return Err(ScriptError::EqualVerify);
                    }
                } else {
                    stack.push(bool_to_vec(equal));
                }
            }

            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let value = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                let result = match opcode {
                    OP_1ADD => checked_script_op(value, 1, |a, b| a.checked_add(b))?,
                    OP_1SUB => checked_script_op(value, 1, |a, b| a.checked_sub(b))?,
                    OP_NEGATE => checked_script_op(value, 0, |a, _| a.checked_neg())?,
                    OP_ABS => checked_script_op(value, 0, |a, _| a.checked_abs())?,
                    OP_NOT => i64::from(value == 0),
                    _ => i64::from(value != 0),
                };
                stack.push(encode_script_num(result));
            }
            OP_ADD | OP_SUB | OP_DIV | OP_MOD | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL
            | OP_NUMEQUALVERIFY | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN
            | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                let rhs = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                let lhs = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                let result = match opcode {
                    OP_ADD => checked_script_op(lhs, rhs, |a, b| a.checked_add(b))?,
                    OP_SUB => checked_script_op(lhs, rhs, |a, b| a.checked_sub(b))?,
                    OP_DIV => {
                        if rhs == 0 {
                            return Err(ScriptError::DivByZero);
                        }
                        checked_script_op(lhs, rhs, |a, b| a.checked_div(b))?
                    }
                    OP_MOD => {
                        if rhs == 0 {
                            return Err(ScriptError::ModByZero);
                        }
                        checked_script_op(lhs, rhs, |a, b| a.checked_rem(b))?
                    }
                    OP_BOOLAND => i64::from(lhs != 0 && rhs != 0),
                    OP_BOOLOR => i64::from(lhs != 0 || rhs != 0),
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => i64::from(lhs == rhs),
                    OP_NUMNOTEQUAL => i64::from(lhs != rhs),
                    OP_LESSTHAN => i64::from(lhs < rhs),
                    OP_GREATERTHAN => i64::from(lhs > rhs),
                    OP_LESSTHANOREQUAL => i64::from(lhs <= rhs),
                    OP_GREATERTHANOREQUAL => i64::from(lhs >= rhs),
                    OP_MIN => lhs.min(rhs),
                    _ => lhs.max(rhs),
                };
                if opcode == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::NumEqualVerify);
                    }
                } else {
                    stack.push(encode_script_num(result));
                }
            }
            OP_WITHIN => {
                let max = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                let min = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                let value = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                stack.push(bool_to_vec(min <= value && value < max));
            }

            OP_RIPEMD160 => {
                let data = pop(stack)?;
                let mut hasher = Ripemd160::new();
                hasher.update(data);
                stack.push(hasher.finalize().to_vec());
            }
            OP_SHA1 => {
                let data = pop(stack)?;
                let mut hasher = Sha1::new();
                hasher.update(data);
                stack.push(hasher.finalize().to_vec());
            }
            OP_SHA256 => {
                let data = pop(stack)?;
                stack.push(sha256(&data).to_vec());
            }
            OP_HASH160 => {
                let data = pop(stack)?;
                stack.push(hash160(&data).to_vec());
            }
            OP_HASH256 => {
                let data = pop(stack)?;
                stack.push(sha256d(&data).to_vec());
            }
            OP_CODESEPARATOR => script_code_start = cursor,

            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = pop(stack)?;
                let sig = pop(stack)?;
                check_signature_encoding(&sig, flags)?;
                check_pubkey_encoding(&pubkey, flags)?;
                let script_code = &script[script_code_start..];
                let success = checker.check_sig(&sig, &pubkey, script_code);
                if !sig.is_empty() {
                    metrics.sig_checks += 1;
                }
                if !success && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 && !sig.is_empty() {
                    return Err(ScriptError::SigNullFail);
                }
                if opcode == OP_CHECKSIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    stack.push(bool_to_vec(success));
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let key_count =
                    decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
                    return Err(ScriptError::PubkeyCount);
                }
                op_count += key_count as usize;
                if op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }
                let mut pubkeys = Vec::with_capacity(key_count as usize);
                for _ in 0..key_count {
                    pubkeys.push(pop(stack)?);
                }
                pubkeys.reverse();

                let sig_count =
                    decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
                if sig_count < 0 || sig_count > key_count {
                    return Err(ScriptError::SigCount);
                }
                let mut sigs = Vec::with_capacity(sig_count as usize);
                for _ in 0..sig_count {
                    sigs.push(pop(stack)?);
                }
                sigs.reverse();

                let dummy = pop(stack)?;
                if (flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
                    return Err(ScriptError::SigNullDummy);
                }

                let script_code = &script[script_code_start..];
                let mut sig_index = 0usize;
                let mut key_index = 0usize;
                while sig_index < sigs.len() && key_index < pubkeys.len() {
                    let sig = &sigs[sig_index];
                    check_signature_encoding(sig, flags)?;
                    check_pubkey_encoding(&pubkeys[key_index], flags)?;
                    if checker.check_sig(sig, &pubkeys[key_index], script_code) {
                        sig_index += 1;
                    }
                    key_index += 1;
                    if pubkeys.len() - key_index < sigs.len() - sig_index {
                        break;
                    }
                }
                let success = sig_index == sigs.len();

                if sigs.iter().any(|sig| !sig.is_empty()) {
                    metrics.sig_checks += key_count;
                }
                if !success
                    && (flags & SCRIPT_VERIFY_NULLFAIL) != 0
                    && sigs.iter().any(|sig| !sig.is_empty())
                {
                    return Err(ScriptError::SigNullFail);
                }
                if opcode == OP_CHECKMULTISIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckMultiSigVerify);
                    }
                } else {
                    stack.push(bool_to_vec(success));
                }
            }
            OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY => {
                let pubkey = pop(stack)?;
                let message = pop(stack)?;
                let sig = pop(stack)?;
                check_data_signature_encoding(&sig, flags)?;
                check_pubkey_encoding(&pubkey, flags)?;
                let success = checker.check_data_sig(&sig, &message, &pubkey);
                if !sig.is_empty() {
                    metrics.sig_checks += 1;
                }
                if !success && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 && !sig.is_empty() {
                    return Err(ScriptError::SigNullFail);
                }
                if opcode == OP_CHECKDATASIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckDataSigVerify);
                    }
                } else {
                    stack.push(bool_to_vec(success));
                }
            }

            OP_CHECKLOCKTIMEVERIFY => {
                if (flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) == 0 {
                    if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                } else {
                    let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                    // Lock times need 5 bytes to cover the full u32 range.
                    let lock_time = decode_script_num(top, require_minimal, 5)?;
                    if lock_time < 0 {
                        return Err(ScriptError::NegativeLocktime);
                    }
                    if !checker.check_lock_time(lock_time) {
                        return Err(ScriptError::UnsatisfiedLocktime);
                    }
                }
            }
            OP_CHECKSEQUENCEVERIFY => {
                if (flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY) == 0 {
                    if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                } else {
                    let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                    let sequence = decode_script_num(top, require_minimal, 5)?;
                    if sequence < 0 {
                        return Err(ScriptError::NegativeLocktime);
                    }
                    if (sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG) == 0
                        && !checker.check_sequence(sequence)
                    {
                        return Err(ScriptError::UnsatisfiedLocktime);
                    }
                }
            }
            OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }

            OP_INPUTINDEX..=OP_OUTPUTBYTECODE => {
                if (flags & SCRIPT_NATIVE_INTROSPECTION) == 0 {
                    return Err(ScriptError::BadOpcode);
                }
                let ctx = context.ok_or(ScriptError::ContextNotPresent)?;
                eval_introspection(
                    opcode,
                    script,
                    script_code_start,
                    stack,
                    require_minimal,
                    max_num_size,
                    ctx,
                )?;
            }
            OP_STATESEPARATOR..=OP_STATESEPARATORINDEX_OUTPUT
            | OP_PUSHINPUTREF..=OP_PUSH_TX_STATE => {
                if (flags & SCRIPT_ENHANCED_REFERENCES) == 0 {
                    return Err(ScriptError::BadOpcode);
                }
                let ctx = context.ok_or(ScriptError::ContextNotPresent)?;
                eval_reference(&op, stack, require_minimal, max_num_size, ctx)?;
            }

            _ => return Err(ScriptError::BadOpcode),
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }

    Ok(())
}

/// The nullary and index-taking transaction queries, 0xc0 through 0xcd.
fn eval_introspection(
    opcode: u8,
    script: &[u8],
    script_code_start: usize,
    stack: &mut Vec<Vec<u8>>,
    require_minimal: bool,
    max_num_size: usize,
    ctx: &ScriptExecutionContext,
) -> Result<(), ScriptError> {
    match opcode {
        OP_INPUTINDEX => stack.push(encode_script_num(ctx.input_index() as i64)),
        OP_ACTIVEBYTECODE => {
            let active = &script[script_code_start..];
            if active.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            stack.push(active.to_vec());
        }
        OP_TXVERSION => stack.push(encode_script_num(ctx.tx().version as i64)),
        OP_TXINPUTCOUNT => stack.push(encode_script_num(ctx.tx().vin.len() as i64)),
        OP_TXOUTPUTCOUNT => stack.push(encode_script_num(ctx.tx().vout.len() as i64)),
        OP_TXLOCKTIME => stack.push(encode_script_num(ctx.tx().lock_time as i64)),
        OP_UTXOVALUE => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            require_sibling_coin(ctx, index)?;
            let amount = ctx
                .coin_amount(index)
                .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
            stack.push(encode_script_num(amount));
        }
        OP_UTXOBYTECODE => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            require_sibling_coin(ctx, index)?;
            let script_pubkey = ctx
                .coin_script_pubkey(index)
                .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
            push_script(stack, script_pubkey)?;
        }
        OP_OUTPOINTTXHASH => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            stack.push(ctx.tx().vin[index].prevout.hash.to_vec());
        }
        OP_OUTPOINTINDEX => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            stack.push(encode_script_num(ctx.tx().vin[index].prevout.index as i64));
        }
        OP_INPUTBYTECODE => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            let script_sig = ctx
                .script_sig(index)
                .ok_or(ScriptError::InvalidTxInputIndex)?;
            push_script(stack, script_sig)?;
        }
        OP_INPUTSEQUENCENUMBER => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            stack.push(encode_script_num(ctx.tx().vin[index].sequence as i64));
        }
        OP_OUTPUTVALUE => {
            let index = pop_output_index(stack, require_minimal, max_num_size, ctx)?;
            stack.push(encode_script_num(ctx.tx().vout[index].value));
        }
        OP_OUTPUTBYTECODE => {
            let index = pop_output_index(stack, require_minimal, max_num_size, ctx)?;
            let script_pubkey = ctx.tx().vout[index].script_pubkey.clone();
            if script_pubkey.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            stack.push(script_pubkey);
        }
        _ => return Err(ScriptError::BadOpcode),
    }
    Ok(())
}

/// The reference declarations, state separators, and aggregate queries.
fn eval_reference(
    op: &Op<'_>,
    stack: &mut Vec<Vec<u8>>,
    require_minimal: bool,
    max_num_size: usize,
    ctx: &ScriptExecutionContext,
) -> Result<(), ScriptError> {
    match op.opcode {
        // A marker for the state/code split; execution passes through it.
        OP_STATESEPARATOR => {}
        OP_STATESEPARATORINDEX_UTXO => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            require_sibling_coin(ctx, index)?;
            let offset = ctx
                .separator_offset_utxo(index)
                .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
            stack.push(encode_script_num(offset as i64));
        }
        OP_STATESEPARATORINDEX_OUTPUT => {
            let index = pop_output_index(stack, require_minimal, max_num_size, ctx)?;
            require_sibling_coin(ctx, index)?;
            let offset = ctx
                .separator_offset_output(index)
                .ok_or(ScriptError::InvalidTxOutputIndex)?;
            stack.push(encode_script_num(offset as i64));
        }

        // Declarations push their 36-byte operand; the transaction-wide
        // sourcing rules are enforced outside script execution.
        OP_PUSHINPUTREF
        | OP_REQUIREINPUTREF
        | OP_DISALLOWPUSHINPUTREF
        | OP_DISALLOWPUSHINPUTREFSIBLING
        | OP_PUSHINPUTREFSINGLETON => {
            let id = op.push.ok_or(ScriptError::InvalidTxRefSize)?;
            stack.push(id.to_vec());
        }

        OP_REFHASHDATASUMMARY_UTXO => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            require_sibling_coin(ctx, index)?;
            let summary = ctx
                .data_summary_utxo(index)
                .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
            stack.push(summary.to_vec());
        }
        OP_REFHASHDATASUMMARY_OUTPUT => {
            let index = pop_output_index(stack, require_minimal, max_num_size, ctx)?;
            let summary = ctx
                .data_summary_output(index)
                .ok_or(ScriptError::InvalidTxOutputIndex)?;
            stack.push(summary.to_vec());
        }
        OP_REFHASHVALUESUM_UTXOS => {
            let hash = pop_hash(stack, ScriptError::InvalidTxRefHashSize)?;
            stack.push(encode_script_num(ctx.ref_hash_value_sum_utxos(&hash)));
        }
        OP_REFHASHVALUESUM_OUTPUTS => {
            let hash = pop_hash(stack, ScriptError::InvalidTxRefHashSize)?;
            stack.push(encode_script_num(ctx.ref_hash_value_sum_outputs(&hash)));
        }

        OP_REFTYPE_UTXO => {
            let id = pop_ref_id(stack)?;
            stack.push(encode_script_num(ctx.ref_type_utxo(&id)));
        }
        OP_REFTYPE_OUTPUT => {
            let id = pop_ref_id(stack)?;
            stack.push(encode_script_num(ctx.ref_type_output(&id)));
        }
        OP_REFVALUESUM_UTXOS => {
            let id = pop_ref_id(stack)?;
            stack.push(encode_script_num(ctx.ref_value_sum_utxos(&id)));
        }
        OP_REFVALUESUM_OUTPUTS => {
            let id = pop_ref_id(stack)?;
            stack.push(encode_script_num(ctx.ref_value_sum_outputs(&id)));
        }
        OP_REFOUTPUTCOUNT_UTXOS => {
            let id = pop_ref_id(stack)?;
            stack.push(encode_script_num(ctx.ref_output_count_utxos(&id)));
        }
        OP_REFOUTPUTCOUNT_OUTPUTS => {
            let id = pop_ref_id(stack)?;
            stack.push(encode_script_num(ctx.ref_output_count_outputs(&id)));
        }
        OP_REFOUTPUTCOUNTZEROVALUED_UTXOS => {
            let id = pop_ref_id(stack)?;
            stack.push(encode_script_num(ctx.ref_zero_valued_count_utxos(&id)));
        }
        OP_REFOUTPUTCOUNTZEROVALUED_OUTPUTS => {
            let id = pop_ref_id(stack)?;
            stack.push(encode_script_num(ctx.ref_zero_valued_count_outputs(&id)));
        }

        OP_REFDATASUMMARY_UTXO => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            require_sibling_coin(ctx, index)?;
            let concat = ctx
                .ref_concat_utxo(index)
                .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
            push_script(stack, concat)?;
        }
        OP_REFDATASUMMARY_OUTPUT => {
            let index = pop_output_index(stack, require_minimal, max_num_size, ctx)?;
            let concat = ctx
                .ref_concat_output(index)
                .ok_or(ScriptError::InvalidTxOutputIndex)?;
            push_script(stack, concat)?;
        }

        OP_CODESCRIPTHASHVALUESUM_UTXOS => {
            let hash = pop_hash(stack, ScriptError::InvalidTxHashSize)?;
            stack.push(encode_script_num(ctx.code_script_value_sum_utxos(&hash)));
        }
        OP_CODESCRIPTHASHVALUESUM_OUTPUTS => {
            let hash = pop_hash(stack, ScriptError::InvalidTxHashSize)?;
            stack.push(encode_script_num(ctx.code_script_value_sum_outputs(&hash)));
        }
        OP_CODESCRIPTHASHOUTPUTCOUNT_UTXOS => {
            let hash = pop_hash(stack, ScriptError::InvalidTxHashSize)?;
            stack.push(encode_script_num(ctx.code_script_count_utxos(&hash)));
        }
        OP_CODESCRIPTHASHOUTPUTCOUNT_OUTPUTS => {
            let hash = pop_hash(stack, ScriptError::InvalidTxHashSize)?;
            stack.push(encode_script_num(ctx.code_script_count_outputs(&hash)));
        }
        OP_CODESCRIPTHASHZEROVALUEDOUTPUTCOUNT_UTXOS => {
            let hash = pop_hash(stack, ScriptError::InvalidTxHashSize)?;
            stack.push(encode_script_num(ctx.code_script_zero_valued_count_utxos(&hash)));
        }
        OP_CODESCRIPTHASHZEROVALUEDOUTPUTCOUNT_OUTPUTS => {
            let hash = pop_hash(stack, ScriptError::InvalidTxHashSize)?;
            stack.push(encode_script_num(ctx.code_script_zero_valued_count_outputs(&hash)));
        }

        OP_CODESCRIPTBYTECODE_UTXO => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            require_sibling_coin(ctx, index)?;
            let script_pubkey = ctx
                .coin_script_pubkey(index)
                .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
            if script_pubkey.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            stack.push(script::code_script(script_pubkey).to_vec());
        }
        OP_CODESCRIPTBYTECODE_OUTPUT => {
            let index = pop_output_index(stack, require_minimal, max_num_size, ctx)?;
            let script_pubkey = &ctx.tx().vout[index].script_pubkey;
            if script_pubkey.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            stack.push(script::code_script(script_pubkey).to_vec());
        }
        OP_STATESCRIPTBYTECODE_UTXO => {
            let index = pop_input_index(stack, require_minimal, max_num_size, ctx)?;
            require_sibling_coin(ctx, index)?;
            let script_pubkey = ctx
                .coin_script_pubkey(index)
                .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
            push_script(stack, script::state_script(script_pubkey))?;
        }
        OP_STATESCRIPTBYTECODE_OUTPUT => {
            let index = pop_output_index(stack, require_minimal, max_num_size, ctx)?;
            let script_pubkey = &ctx.tx().vout[index].script_pubkey;
            push_script(stack, script::state_script(script_pubkey))?;
        }

        OP_PUSH_TX_STATE => {
            let field = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
            match field {
                0 => stack.push(ctx.txid().to_vec()),
                1 => {
                    let total = ctx
                        .total_input_value()
                        .ok_or(ScriptError::LimitedContextNoSiblingInfo)?;
                    stack.push(encode_script_num(total));
                }
                2 => stack.push(encode_script_num(ctx.total_output_value())),
                _ => return Err(ScriptError::InvalidTxStateItem),
            }
        }

        _ => return Err(ScriptError::BadOpcode),
    }
    Ok(())
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn pop_input_index(
    stack: &mut Vec<Vec<u8>>,
    require_minimal: bool,
    max_num_size: usize,
    ctx: &ScriptExecutionContext,
) -> Result<usize, ScriptError> {
    let index = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
    if index < 0 || index as usize >= ctx.tx().vin.len() {
        return Err(ScriptError::InvalidTxInputIndex);
    }
    Ok(index as usize)
}

fn pop_output_index(
    stack: &mut Vec<Vec<u8>>,
    require_minimal: bool,
    max_num_size: usize,
    ctx: &ScriptExecutionContext,
) -> Result<usize, ScriptError> {
    let index = decode_script_num(&pop(stack)?, require_minimal, max_num_size)?;
    if index < 0 || index as usize >= ctx.tx().vout.len() {
        return Err(ScriptError::InvalidTxOutputIndex);
    }
    Ok(index as usize)
}

fn pop_ref_id(stack: &mut Vec<Vec<u8>>) -> Result<RefId, ScriptError> {
    pop(stack)?
        .as_slice()
        .try_into()
        .map_err(|_| ScriptError::InvalidTxRefSize)
}

fn pop_hash(stack: &mut Vec<Vec<u8>>, err: ScriptError) -> Result<[u8; 32], ScriptError> {
    pop(stack)?.as_slice().try_into().map_err(|_| err)
}

/// Queries of sibling coins fail on a limited context.
fn require_sibling_coin(
    ctx: &ScriptExecutionContext,
    index: usize,
) -> Result<(), ScriptError> {
    if ctx.is_limited() && index != ctx.input_index() {
        return Err(ScriptError::LimitedContextNoSiblingInfo);
    }
    Ok(())
}

fn push_script(stack: &mut Vec<Vec<u8>>, data: &[u8]) -> Result<(), ScriptError> {
    if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
        return Err(ScriptError::PushSize);
    }
    stack.push(data.to_vec());
    Ok(())
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

pub(crate) fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Strip a raw byte string down to the minimal script-number encoding.
fn minimal_num_bytes(mut data: Vec<u8>) -> Vec<u8> {
    let Some(&last) = data.last() else {
        return data;
    };
    if (last & 0x7f) != 0 {
        return data;
    }
    if data.len() == 1 {
        return Vec::new();
    }
    if data[data.len() - 2] & 0x80 != 0 {
        return data;
    }
    let mut i = data.len() - 1;
    while i > 0 {
        if data[i - 1] != 0 {
            if data[i - 1] & 0x80 != 0 {
                // The sign bit is taken; keep one extra byte for it.
                data[i] = last;
                data.truncate(i + 1);
            } else {
                data[i - 1] |= last;
                data.truncate(i);
            }
            return data;
        }
        i -= 1;
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::BaseSignatureChecker;
    use crate::context::ScriptExecutionContext;
    use emberd_primitives::coin::Coin;
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{Transaction, TxIn, TxOut};
    use std::collections::HashMap;
    use std::sync::Arc;

    const TEST_FLAGS: ScriptFlags = SCRIPT_VERIFY_MINIMALDATA
        | SCRIPT_NATIVE_INTROSPECTION
        | SCRIPT_ENHANCED_REFERENCES
        | SCRIPT_64_BIT_INTEGERS;

    fn run(script: &[u8], context: Option<&ScriptExecutionContext>) -> Result<Vec<Vec<u8>>, ScriptError> {
        let mut stack = Vec::new();
        let mut metrics = ScriptExecutionMetrics::default();
        eval_script(
            script,
            &mut stack,
            TEST_FLAGS,
            &BaseSignatureChecker,
            context,
            &mut metrics,
        )?;
        Ok(stack)
    }

    fn context_with_values(values: &[i64]) -> ScriptExecutionContext {
        let mut vin = Vec::new();
        let mut coins = HashMap::new();
        for (i, value) in values.iter().enumerate() {
            let prevout = OutPoint::new([i as u8 + 1; 32], i as u32);
            vin.push(TxIn::new(prevout.clone(), vec![0x51], 0xffff_ffff));
            coins.insert(prevout, Coin::new(TxOut::new(*value, vec![0x51]), 10, false));
        }
        let tx = Arc::new(Transaction {
            version: 2,
            vin,
            vout: vec![TxOut::new(500, vec![0x51])],
            lock_time: 0,
        });
        ScriptExecutionContext::create_for_all_inputs(tx, &coins)
            .expect("context")
            .remove(0)
    }

    #[test]
    fn arithmetic_and_comparison() {
        let stack = run(&[OP_2, OP_3, OP_ADD], None).unwrap();
        assert_eq!(stack, vec![vec![5]]);

        let stack = run(&[OP_7, OP_2, OP_DIV], None).unwrap();
        assert_eq!(stack, vec![vec![3]]);

        assert_eq!(run(&[OP_1, OP_0, OP_DIV], None).unwrap_err(), ScriptError::DivByZero);
        assert_eq!(run(&[OP_1, OP_0, OP_MOD], None).unwrap_err(), ScriptError::ModByZero);
    }

    #[test]
    fn conditionals_must_balance() {
        let stack = run(&[OP_1, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF], None).unwrap();
        assert_eq!(stack, vec![vec![2]]);

        assert_eq!(
            run(&[OP_1, OP_IF, OP_2], None).unwrap_err(),
            ScriptError::UnbalancedConditional
        );
        assert_eq!(run(&[OP_ENDIF], None).unwrap_err(), ScriptError::UnbalancedConditional);
    }

    #[test]
    fn disabled_opcodes_fail_unexecuted() {
        assert_eq!(
            run(&[OP_0, OP_IF, OP_MUL, OP_ENDIF], None).unwrap_err(),
            ScriptError::DisabledOpcode
        );
    }

    #[test]
    fn op_return_aborts() {
        assert_eq!(run(&[OP_1, OP_RETURN], None).unwrap_err(), ScriptError::OpReturn);
    }

    #[test]
    fn non_minimal_push_is_rejected() {
        assert_eq!(run(&[0x01, 0x05], None).unwrap_err(), ScriptError::MinimalData);
    }

    #[test]
    fn splice_family() {
        // "abcd" 2 SPLIT -> "ab" "cd", then CAT restores it.
        let script = [0x04, b'a', b'b', b'c', b'd', OP_2, OP_SPLIT, OP_CAT];
        let stack = run(&script, None).unwrap();
        assert_eq!(stack, vec![b"abcd".to_vec()]);

        let script = [0x02, b'a', b'b', OP_5, OP_SPLIT];
        assert_eq!(run(&script, None).unwrap_err(), ScriptError::InvalidSplitRange);
    }

    #[test]
    fn num2bin_and_back() {
        let script = [OP_5, OP_4, OP_NUM2BIN];
        let stack = run(&script, None).unwrap();
        assert_eq!(stack, vec![vec![5, 0, 0, 0]]);

        let script = [OP_5, OP_4, OP_NUM2BIN, OP_BIN2NUM];
        let stack = run(&script, None).unwrap();
        assert_eq!(stack, vec![vec![5]]);
    }

    #[test]
    fn introspection_needs_context() {
        assert_eq!(
            run(&[OP_INPUTINDEX], None).unwrap_err(),
            ScriptError::ContextNotPresent
        );
    }

    #[test]
    fn utxo_value_pushes_coin_amount() {
        let ctx = context_with_values(&[2_000]);
        let stack = run(&[OP_0, OP_UTXOVALUE], Some(&ctx)).unwrap();
        assert_eq!(stack, vec![encode_script_num(2_000)]);
    }

    #[test]
    fn input_index_out_of_range() {
        let ctx = context_with_values(&[2_000]);
        assert_eq!(
            run(&[OP_5, OP_UTXOVALUE], Some(&ctx)).unwrap_err(),
            ScriptError::InvalidTxInputIndex
        );
        assert_eq!(
            run(&[OP_5, OP_OUTPUTVALUE], Some(&ctx)).unwrap_err(),
            ScriptError::InvalidTxOutputIndex
        );
    }

    #[test]
    fn limited_context_denies_sibling_queries() {
        let prev_a = OutPoint::new([1u8; 32], 0);
        let prev_b = OutPoint::new([2u8; 32], 0);
        let tx = Arc::new(Transaction {
            version: 2,
            vin: vec![
                TxIn::new(prev_a.clone(), Vec::new(), 0xffff_ffff),
                TxIn::new(prev_b, Vec::new(), 0xffff_ffff),
            ],
            vout: vec![TxOut::new(100, vec![0x51])],
            lock_time: 0,
        });
        let own = Coin::new(TxOut::new(1_000, vec![0x51]), 10, false);
        let ctx = ScriptExecutionContext::limited(0, own, tx).expect("limited");

        let stack = run(&[OP_0, OP_UTXOVALUE], Some(&ctx)).unwrap();
        assert_eq!(stack, vec![encode_script_num(1_000)]);
        assert_eq!(
            run(&[OP_1, OP_UTXOVALUE], Some(&ctx)).unwrap_err(),
            ScriptError::LimitedContextNoSiblingInfo
        );
        // Transaction-wide input value is unknown on a limited context.
        assert_eq!(
            run(&[OP_1, OP_PUSH_TX_STATE], Some(&ctx)).unwrap_err(),
            ScriptError::LimitedContextNoSiblingInfo
        );
    }

    #[test]
    fn push_tx_state_fields() {
        let ctx = context_with_values(&[2_000]);
        let stack = run(&[OP_0, OP_PUSH_TX_STATE], Some(&ctx)).unwrap();
        assert_eq!(stack, vec![ctx.txid().to_vec()]);

        let stack = run(&[OP_2, OP_PUSH_TX_STATE], Some(&ctx)).unwrap();
        assert_eq!(stack, vec![encode_script_num(500)]);

        assert_eq!(
            run(&[OP_7, OP_PUSH_TX_STATE], Some(&ctx)).unwrap_err(),
            ScriptError::InvalidTxStateItem
        );
    }

    #[test]
    fn ref_declaration_pushes_operand() {
        let ctx = context_with_values(&[2_000]);
        let mut script = vec![OP_PUSHINPUTREF];
        script.extend_from_slice(&[0x42; 36]);
        // An undeclared ref is a transaction-level failure; execution
        // itself just pushes the operand.
        let stack = run(&script, Some(&ctx)).unwrap();
        assert_eq!(stack, vec![vec![0x42; 36]]);
    }

    #[test]
    fn ref_aggregate_operand_sizes() {
        let ctx = context_with_values(&[2_000]);
        let script = [0x02, 0xaa, 0xbb, OP_REFVALUESUM_OUTPUTS];
        assert_eq!(run(&script, Some(&ctx)).unwrap_err(), ScriptError::InvalidTxRefSize);

        let script = [0x02, 0xaa, 0xbb, OP_REFHASHVALUESUM_OUTPUTS];
        assert_eq!(
            run(&script, Some(&ctx)).unwrap_err(),
            ScriptError::InvalidTxRefHashSize
        );

        let script = [0x02, 0xaa, 0xbb, OP_CODESCRIPTHASHVALUESUM_OUTPUTS];
        assert_eq!(run(&script, Some(&ctx)).unwrap_err(), ScriptError::InvalidTxHashSize);
    }

    #[test]
    fn active_bytecode_respects_element_limit() {
        let ctx = context_with_values(&[2_000]);

        // 3-byte PUSHDATA2 header + payload + the opcode itself.
        let mut script = vec![OP_PUSHDATA2];
        script.extend_from_slice(&516u16.to_le_bytes());
        script.extend_from_slice(&[0x61; 516]);
        script.push(OP_ACTIVEBYTECODE);
        assert_eq!(script.len(), 520);
        let stack = run(&script, Some(&ctx)).unwrap();
        assert_eq!(stack[1], script);

        let mut script = vec![OP_PUSHDATA2];
        script.extend_from_slice(&517u16.to_le_bytes());
        script.extend_from_slice(&[0x61; 517]);
        script.push(OP_ACTIVEBYTECODE);
        assert_eq!(script.len(), 521);
        assert_eq!(run(&script, Some(&ctx)).unwrap_err(), ScriptError::PushSize);
    }

    #[test]
    fn state_script_bytecode_output() {
        let locking = vec![0x02, 0xaa, 0xbb, OP_STATESEPARATOR, OP_DUP, OP_DROP];
        let prev = OutPoint::new([9u8; 32], 0);
        let tx = Arc::new(Transaction {
            version: 2,
            vin: vec![TxIn::new(prev.clone(), Vec::new(), 0xffff_ffff)],
            vout: vec![TxOut::new(100, locking.clone())],
            lock_time: 0,
        });
        let mut coins = HashMap::new();
        coins.insert(prev, Coin::new(TxOut::new(1_000, vec![0x51]), 10, false));
        let ctx = ScriptExecutionContext::create_for_all_inputs(tx, &coins)
            .expect("context")
            .remove(0);

        let stack = run(&[OP_0, OP_STATESCRIPTBYTECODE_OUTPUT], Some(&ctx)).unwrap();
        assert_eq!(stack, vec![vec![0x02, 0xaa, 0xbb]]);

        let stack = run(&[OP_0, OP_CODESCRIPTBYTECODE_OUTPUT], Some(&ctx)).unwrap();
        assert_eq!(stack, vec![vec![OP_DUP, OP_DROP]]);

        let stack = run(&[OP_0, OP_STATESEPARATORINDEX_OUTPUT], Some(&ctx)).unwrap();
        assert_eq!(stack, vec![encode_script_num(4)]);

        // The spent coin carries no separator, so its offset is zero.
        let stack = run(&[OP_0, OP_STATESEPARATORINDEX_UTXO], Some(&ctx)).unwrap();
        assert_eq!(stack, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn verify_script_p2sh_redeem() {
        let redeem_script = vec![OP_2, OP_EQUAL];
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&hash160(&redeem_script));
        script_pubkey.push(OP_EQUAL);

        let mut script_sig = vec![OP_2, redeem_script.len() as u8];
        script_sig.extend_from_slice(&redeem_script);

        let flags = TEST_FLAGS | SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_CLEANSTACK;
        verify_script(&script_sig, &script_pubkey, flags, &BaseSignatureChecker, None)
            .expect("p2sh spend");

        // A failing redeem script fails the whole spend.
        let mut bad_sig = vec![OP_3, redeem_script.len() as u8];
        bad_sig.extend_from_slice(&redeem_script);
        assert_eq!(
            verify_script(&bad_sig, &script_pubkey, flags, &BaseSignatureChecker, None)
                .unwrap_err(),
            ScriptError::EvalFalse
        );
    }

    #[test]
    fn op_count_limit_is_enforced() {
        let mut script = vec![OP_1];
        script.extend(std::iter::repeat(OP_NOP).take(MAX_OPS_PER_SCRIPT));
        assert!(run(&script, None).is_ok());

        script.push(OP_NOP);
        assert_eq!(run(&script, None).unwrap_err(), ScriptError::OpCount);
    }

    #[test]
    fn multisig_rejects_too_many_pubkeys() {
        let script = [0x01, MAX_PUBKEYS_PER_MULTISIG as u8 + 1, OP_CHECKMULTISIG];
        assert_eq!(run(&script, None).unwrap_err(), ScriptError::PubkeyCount);
    }

    #[test]
    fn cleanstack_requires_single_element() {
        let flags = TEST_FLAGS | SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_CLEANSTACK;
        assert_eq!(
            verify_script(&[OP_1, OP_1], &[OP_1], flags, &BaseSignatureChecker, None)
                .unwrap_err(),
            ScriptError::CleanStack
        );
    }
}
