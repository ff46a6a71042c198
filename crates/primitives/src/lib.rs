//! Core transaction types, coins, and consensus serialization.

pub mod coin;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use coin::{Coin, CoinView};
pub use hash::{hash160, hash256_to_hex, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxId, TxIn, TxOut};
