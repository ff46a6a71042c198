//! Input script validation for mempool admission and block connect.
//!
//! Admission runs checks synchronously against strict flags; block connect
//! defers them into a batch that a rayon pool drains after the cheap
//! per-transaction work is done.

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;

use emberd_primitives::coin::CoinView;
use emberd_primitives::transaction::Transaction;
use emberd_script::context::ContextError;
use emberd_script::refs::validate_reference_operations;
use emberd_script::{
    CheckInputsLimiter, ScriptCheck, ScriptError, ScriptExecutionContext, ScriptFlags,
    TxSigCheckLimiter,
};

#[derive(Debug)]
pub enum InputCheckError {
    /// Context construction failed: an input is unresolvable or a
    /// reference declaration is malformed.
    Context(ContextError),
    /// One input's scripts did not verify.
    Script {
        input_index: usize,
        error: ScriptError,
    },
    /// The transaction-wide reference induction rule failed.
    References(ScriptError),
    /// The synchronous input-check budget ran out.
    TooManyInputChecks,
    /// The signature-check budget ran out.
    TooManySigChecks,
}

impl fmt::Display for InputCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputCheckError::Context(err) => write!(f, "{err}"),
            InputCheckError::Script { input_index, error } => {
                write!(f, "input {input_index} failed script verification: {error}")
            }
            InputCheckError::References(err) => {
                write!(f, "reference validation failed: {err}")
            }
            InputCheckError::TooManyInputChecks => write!(f, "too many pending input checks"),
            InputCheckError::TooManySigChecks => write!(f, "too many signature checks"),
        }
    }
}

impl std::error::Error for InputCheckError {}

/// Validates every input of `tx`. With `deferred` set, the per-input
/// script checks are queued there instead of executed and the caller runs
/// them later; context construction and reference validation always happen
/// now. Returns the signature checks consumed by inline execution.
pub fn check_inputs(
    tx: &Arc<Transaction>,
    coins: &impl CoinView,
    flags: ScriptFlags,
    sig_check_limiter: &TxSigCheckLimiter,
    input_check_limiter: Option<&CheckInputsLimiter>,
    deferred: Option<&mut Vec<ScriptCheck>>,
) -> Result<i64, InputCheckError> {
    let contexts = ScriptExecutionContext::create_for_all_inputs(Arc::clone(tx), coins)
        .map_err(InputCheckError::Context)?;
    // The induction rule spans the whole transaction; one context sees it
    // all.
    if let Some(first) = contexts.first() {
        validate_reference_operations(first).map_err(InputCheckError::References)?;
    }

    match deferred {
        Some(queue) => {
            queue.reserve(contexts.len());
            for context in contexts {
                queue.push(ScriptCheck::new(context, flags));
            }
            Ok(0)
        }
        None => {
            let mut consumed = 0i64;
            for context in contexts {
                let check = ScriptCheck::new(context, flags);
                consumed += run_one(&check, sig_check_limiter, input_check_limiter)?;
            }
            Ok(consumed)
        }
    }
}

/// Drains a deferred batch in parallel. Any failing input fails the whole
/// batch.
pub fn run_deferred_checks(
    checks: &[ScriptCheck],
    sig_check_limiter: &TxSigCheckLimiter,
    input_check_limiter: Option<&CheckInputsLimiter>,
) -> Result<(), InputCheckError> {
    checks
        .par_iter()
        .try_for_each(|check| run_one(check, sig_check_limiter, input_check_limiter).map(|_| ()))
}

fn run_one(
    check: &ScriptCheck,
    sig_check_limiter: &TxSigCheckLimiter,
    input_check_limiter: Option<&CheckInputsLimiter>,
) -> Result<i64, InputCheckError> {
    if let Some(limiter) = input_check_limiter {
        if !limiter.consume_and_check() {
            return Err(InputCheckError::TooManyInputChecks);
        }
    }
    let metrics = check.execute().map_err(|error| InputCheckError::Script {
        input_index: check.input_index(),
        error,
    })?;
    if !sig_check_limiter.consume_and_check(metrics.sig_checks) {
        return Err(InputCheckError::TooManySigChecks);
    }
    Ok(metrics.sig_checks)
}
