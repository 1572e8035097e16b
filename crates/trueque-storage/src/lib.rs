//! Storage layer for the trueque marketplace.
//!
//! Defines the persistent record model, per-concern storage traits, and two
//! engines: an in-memory engine for tests and local runs, and a PostgreSQL
//! engine for production. Every compound invariant (balance sufficiency,
//! trade completion, redemption vending) is a single trait method so each
//! engine owns its transaction boundary.

#![deny(unsafe_code)]

mod config;
mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod traits;

pub use config::{open, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorage;
pub use model::*;
pub use postgres::PostgresStorage;
pub use traits::{
    CompanyStore, LedgerStore, ListingStore, QueryWindow, RewardStore, SettingStore, TradeStore,
    TruequeStorage, UserStore,
};
