//! Market price sources: the Binance P2P public search endpoint for
//! production, a fixed quote for tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use trueque_core::connectors::PriceSource;
use trueque_core::{CoreError, CoreResult};

/// Public Binance P2P advert search endpoint.
pub const BINANCE_P2P_ENDPOINT: &str =
    "https://p2p.binance.com/bapi/c2c/v2/friendly/c2c/adv/search";

/// Averages the first page of SELL-side USDT/BOB adverts.
pub struct BinanceP2P {
    client: reqwest::Client,
    endpoint: String,
}

impl BinanceP2P {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for BinanceP2P {
    fn default() -> Self {
        Self::new(BINANCE_P2P_ENDPOINT)
    }
}

#[async_trait]
impl PriceSource for BinanceP2P {
    async fn usdt_bob(&self) -> CoreResult<Decimal> {
        let request = json!({
            "page": 1,
            "rows": 10,
            "payTypes": [],
            "asset": "USDT",
            "fiat": "BOB",
            "tradeType": "SELL",
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(format!("price endpoint unreachable: {e}")))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Unavailable(format!("malformed price response: {e}")))?;
        let price = average_sell_price(&payload)?;
        tracing::debug!(price = %price, "usdt/bob quote fetched");
        Ok(price)
    }
}

/// Average of the advert prices in a P2P search response. An empty market
/// is `Unavailable`, never zero.
fn average_sell_price(payload: &Value) -> CoreResult<Decimal> {
    let offers = payload
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::Unavailable("price response has no data array".to_string()))?;
    let mut sum = Decimal::ZERO;
    let mut count = 0;
    for offer in offers {
        if let Some(price) = offer
            .pointer("/adv/price")
            .and_then(Value::as_str)
            .and_then(|p| Decimal::from_str(p).ok())
        {
            sum += price;
            count += 1;
        }
    }
    if count == 0 {
        return Err(CoreError::Unavailable(
            "no sell offers in the market response".to_string(),
        ));
    }
    Ok(sum / Decimal::from(count))
}

/// Test double returning a constant quote.
pub struct FixedPrice(pub Decimal);

#[async_trait]
impl PriceSource for FixedPrice {
    async fn usdt_bob(&self) -> CoreResult<Decimal> {
        Ok(self.0)
    }
}
