//! Consensus constants and the money model.

pub mod constants;
pub mod feerate;
pub mod money;

pub use feerate::FeeRate;
pub use money::{money_range, Amount, COIN, MAX_MONEY};

/// A 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
