//! Implementations of the `trueque-core` connector traits.

#![deny(unsafe_code)]

mod market;
mod media;

pub use market::{BinanceP2P, FixedPrice, BINANCE_P2P_ENDPOINT};
pub use media::{InMemoryMediaStore, LocalMediaStore};
