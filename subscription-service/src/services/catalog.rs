//! Bundle price lookup.

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use async_trait::async_trait;
use std::collections::HashMap;

/// Maps a bundle to its weekly fee.
#[async_trait]
pub trait PriceCatalog: Send + Sync {
    async fn price(&self, bundle_id: i64) -> BillingResult<u64>;
}

/// Prices taken from configuration, with an optional fallback fee.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceCatalog {
    prices: HashMap<i64, u64>,
    default_price: Option<u64>,
}

impl StaticPriceCatalog {
    pub fn new(prices: HashMap<i64, u64>, default_price: Option<u64>) -> Self {
        Self {
            prices,
            default_price,
        }
    }

    /// Every bundle costs `price`.
    pub fn flat(price: u64) -> Self {
        Self::new(HashMap::new(), Some(price))
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        Self::new(config.bundle_prices.clone(), config.default_price)
    }

    pub fn with_price(mut self, bundle_id: i64, price: u64) -> Self {
        self.prices.insert(bundle_id, price);
        self
    }
}

#[async_trait]
impl PriceCatalog for StaticPriceCatalog {
    async fn price(&self, bundle_id: i64) -> BillingResult<u64> {
        let price = self
            .prices
            .get(&bundle_id)
            .copied()
            .or(self.default_price)
            .ok_or_else(|| BillingError::Catalog(format!("bundle {} has no price", bundle_id)))?;

        if price == 0 {
            return Err(BillingError::Catalog(format!(
                "bundle {} has a zero price",
                bundle_id
            )));
        }
        Ok(price)
    }
}
