//! Domain services for the trueque marketplace.
//!
//! The ledger is the only component that writes balances or postings; trade
//! negotiation and redemption both delegate their balance changes to it.
//! External collaborators (media storage, market prices) are trait seams in
//! [`connectors`], implemented in `trueque-adapters`.

#![deny(unsafe_code)]

pub mod auth;
pub mod connectors;
pub mod directory;
mod error;
pub mod ledger;
pub mod listings;
pub mod rewards;
pub mod settings;
pub mod trades;

pub use error::{CoreError, CoreResult};
