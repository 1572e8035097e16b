//! Trait seams for external collaborators. Implementations live in
//! `trueque-adapters`; the core never re-verifies what they return.

use crate::CoreResult;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Binary object storage for listing and reward images.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Store an object and return the URL it is addressable under.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> CoreResult<String>;

    /// Delete a previously stored object by its URL.
    async fn delete(&self, url: &str) -> CoreResult<()>;
}

/// External market price quotes.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Current USDT/BOB sell price. Never zero; an empty market reports
    /// `Unavailable`.
    async fn usdt_bob(&self) -> CoreResult<Decimal>;
}
