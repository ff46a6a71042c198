//! Script interpreter, execution contexts, and signature checking.

pub mod check;
pub mod context;
pub mod error;
pub mod interpreter;
pub mod refs;
pub mod script;
pub mod scriptnum;
mod secp;
pub mod sighash;

pub use check::{
    BaseSignatureChecker, CheckInputsLimiter, ScriptCheck, SignatureChecker,
    TransactionSignatureChecker, TxSigCheckLimiter,
};
pub use context::ScriptExecutionContext;
pub use error::ScriptError;
pub use interpreter::{eval_script, verify_script, ScriptExecutionMetrics, ScriptFlags};
pub use script::RefId;
