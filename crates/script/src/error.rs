//! Script evaluation error taxonomy.

/// Every way a script evaluation can fail. Callers must check the exact
/// variant; there is no catch-all success signal besides `Ok(())`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    SigCount,
    PubkeyCount,
    InvalidOperandSize,
    InvalidNumberRange,
    ImpossibleEncoding,
    InvalidSplitRange,
    Verify,
    EqualVerify,
    CheckSigVerify,
    CheckMultiSigVerify,
    CheckDataSigVerify,
    NumEqualVerify,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    InvalidAltstackOperation,
    UnbalancedConditional,
    DivByZero,
    ModByZero,
    NegativeLocktime,
    UnsatisfiedLocktime,
    SigHashType,
    SigDer,
    MinimalData,
    SigPushOnly,
    SigHighS,
    SigNullDummy,
    SigNullFail,
    PubkeyType,
    CleanStack,
    MustUseForkId,
    DiscourageUpgradableNops,
    ContextNotPresent,
    InvalidTxInputIndex,
    InvalidTxOutputIndex,
    LimitedContextNoSiblingInfo,
    InvalidTxRefSize,
    InvalidTxRefHashSize,
    InvalidTxHashSize,
    InvalidTxStateItem,
    RefMissingFromInputs,
    RequireRefMissingFromInputs,
    SingletonRefMissingFromInputs,
    DisallowedSiblingRef,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ScriptError::EvalFalse => "script evaluated to false",
            ScriptError::OpReturn => "OP_RETURN was encountered",
            ScriptError::ScriptSize => "script is too big",
            ScriptError::PushSize => "push value size limit exceeded",
            ScriptError::OpCount => "operation limit exceeded",
            ScriptError::StackSize => "stack size limit exceeded",
            ScriptError::SigCount => "signature count negative or exceeds pubkey count",
            ScriptError::PubkeyCount => "pubkey count negative or limit exceeded",
            ScriptError::InvalidOperandSize => "invalid operand size",
            ScriptError::InvalidNumberRange => "number is outside the allowed range",
            ScriptError::ImpossibleEncoding => "value cannot be represented in the requested size",
            ScriptError::InvalidSplitRange => "invalid OP_SPLIT range",
            ScriptError::Verify => "OP_VERIFY failed",
            ScriptError::EqualVerify => "OP_EQUALVERIFY failed",
            ScriptError::CheckSigVerify => "OP_CHECKSIGVERIFY failed",
            ScriptError::CheckMultiSigVerify => "OP_CHECKMULTISIGVERIFY failed",
            ScriptError::CheckDataSigVerify => "OP_CHECKDATASIGVERIFY failed",
            ScriptError::NumEqualVerify => "OP_NUMEQUALVERIFY failed",
            ScriptError::BadOpcode => "opcode missing or not understood",
            ScriptError::DisabledOpcode => "attempted to use a disabled opcode",
            ScriptError::InvalidStackOperation => "operation not valid with the current stack size",
            ScriptError::InvalidAltstackOperation => {
                "operation not valid with the current altstack size"
            }
            ScriptError::UnbalancedConditional => "unbalanced conditional",
            ScriptError::DivByZero => "division by zero",
            ScriptError::ModByZero => "modulo by zero",
            ScriptError::NegativeLocktime => "negative locktime",
            ScriptError::UnsatisfiedLocktime => "locktime requirement not satisfied",
            ScriptError::SigHashType => "signature hash type missing or not understood",
            ScriptError::SigDer => "non-canonical DER signature",
            ScriptError::MinimalData => "data push larger than necessary",
            ScriptError::SigPushOnly => "only push operators allowed in signature scripts",
            ScriptError::SigHighS => "non-canonical signature: S value is high",
            ScriptError::SigNullDummy => "dummy CHECKMULTISIG argument must be zero",
            ScriptError::SigNullFail => "signature must be zero for failed CHECK(MULTI)SIG",
            ScriptError::PubkeyType => "public key is neither compressed or uncompressed",
            ScriptError::CleanStack => "stack not clean after evaluation",
            ScriptError::MustUseForkId => "signature must use the fork id sighash",
            ScriptError::DiscourageUpgradableNops => "NOPx reserved for soft-fork upgrades",
            ScriptError::ContextNotPresent => "introspection requires an execution context",
            ScriptError::InvalidTxInputIndex => "transaction input index out of range",
            ScriptError::InvalidTxOutputIndex => "transaction output index out of range",
            ScriptError::LimitedContextNoSiblingInfo => {
                "limited context has no sibling input information"
            }
            ScriptError::InvalidTxRefSize => "reference id must be 36 bytes",
            ScriptError::InvalidTxRefHashSize => "reference hash must be 32 bytes",
            ScriptError::InvalidTxHashSize => "script hash must be 32 bytes",
            ScriptError::InvalidTxStateItem => "unknown transaction state field",
            ScriptError::RefMissingFromInputs => "output pushes a reference not present in inputs",
            ScriptError::RequireRefMissingFromInputs => {
                "output requires a reference not present in inputs"
            }
            ScriptError::SingletonRefMissingFromInputs => {
                "output pushes a singleton reference not present in inputs"
            }
            ScriptError::DisallowedSiblingRef => {
                "reference appears in a sibling output that disallows it"
            }
        };
        write!(f, "{message}")
    }
}

impl std::error::Error for ScriptError {}
