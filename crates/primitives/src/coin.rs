//! UTXO snapshot and the coin lookup seam.

use emberd_consensus::constants::MEMPOOL_HEIGHT;
use emberd_consensus::Amount;

use crate::outpoint::OutPoint;
use crate::transaction::TxOut;

/// One unspent output as seen by validation: the output itself plus the
/// height and coinbase flag of the transaction that created it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub output: TxOut,
    pub height: i32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(output: TxOut, height: i32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    /// A coin created by a transaction that is still only in the mempool.
    pub fn mempool(output: TxOut) -> Self {
        Self {
            output,
            height: MEMPOOL_HEIGHT,
            is_coinbase: false,
        }
    }

    pub fn amount(&self) -> Amount {
        self.output.value
    }

    pub fn is_mempool(&self) -> bool {
        self.height == MEMPOOL_HEIGHT
    }
}

/// Read access to the UTXO set. The storage engine behind it is not this
/// crate's concern.
pub trait CoinView {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.get_coin(outpoint).is_some()
    }
}

impl CoinView for std::collections::HashMap<OutPoint, Coin> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.get(outpoint).cloned()
    }

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.contains_key(outpoint)
    }
}
