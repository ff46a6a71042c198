//! Consensus-wide constants shared across validation.

/// Maximum script size, in bytes (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Maximum size of a single stack element, in bytes (consensus).
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Maximum number of non-push opcodes per script (consensus).
pub const MAX_OPS_PER_SCRIPT: usize = 201;
/// Maximum combined depth of the data stack and alt stack (consensus).
pub const MAX_STACK_SIZE: usize = 1_000;
/// Maximum number of public keys per CHECKMULTISIG (consensus).
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;
/// Serialized size of a push-reference identifier, in bytes (consensus).
pub const REF_ID_SIZE: usize = 36;

/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Threshold below which a lock-time field is a block height rather than a timestamp.
pub const LOCKTIME_THRESHOLD: i64 = 500_000_000;
/// Use the median time past of the previous 11 blocks as the lock-time endpoint.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;

/// Fake height used for coins that only exist in the mempool.
pub const MEMPOOL_HEIGHT: i32 = 0x7FFF_FFFF;
/// Half-life of the mempool's rolling minimum fee decay, in seconds.
pub const ROLLING_FEE_HALFLIFE: i64 = 60 * 60 * 12;
/// Bump added to the rolling minimum fee rate on every size-limit eviction, sat/kB.
pub const MEMPOOL_FULL_FEE_INCREMENT: i64 = 100;
/// Default lifetime of a mempool entry before expiry, in seconds.
pub const DEFAULT_MEMPOOL_EXPIRY: i64 = 60 * 60 * 4;

/// Recursion ceiling for the in-mempool double-spend-proof ancestor search.
pub const DSPROOF_RECURSION_LIMIT: usize = 1_000;
/// How long an orphan double-spend proof is kept, in seconds.
pub const DSPROOF_ORPHAN_KEEP_SECONDS: i64 = 90;
/// Maximum number of orphan double-spend proofs retained at once.
pub const DSPROOF_MAX_ORPHANS: usize = 65_535;

/// Memory cap for the reorg transaction queue, in bytes of transaction data.
pub const MAX_DISCONNECTED_TX_POOL_SIZE: usize = 20 * 20_000_000;
