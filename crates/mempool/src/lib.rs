//! Transaction pool: validated-but-unconfirmed transactions, their
//! parent/child topology, fee-based size limiting, double-spend proofs,
//! and the reorg holding queue.

pub mod dsproof;
pub mod entry;
pub mod persist;
pub mod pool;
pub mod reorg;
pub mod validation;

pub use dsproof::{DoubleSpendProof, DoubleSpendProofStorage, DsProofError, DspId, DspSpender};
pub use entry::TxMempoolEntry;
pub use pool::{
    AncestorLimits, DspSearchError, Mempool, MempoolError, MempoolErrorKind, RemovalReason,
    TxMempoolInfo,
};
pub use reorg::{update_mempool_for_reorg, DisconnectedBlockTransactions, TxInfo};
pub use validation::{check_inputs, run_deferred_checks, InputCheckError};
