use crate::model::Market;
use async_trait::async_trait;
use pipeline_core::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

/// External collaborator: discovers the set of tradeable markets, typically
/// backed by chain-RPC calls. Only the interface is modelled here; the
/// discovery mechanism itself is out of scope.
#[async_trait]
pub trait MarketCatalogue: Send + Sync {
    async fn markets(&self) -> Result<Vec<Market>>;
}

/// Wraps a `MarketCatalogue` and applies the configured exclusion list at
/// both the catalogue boundary and again on every per-row lookup, so an
/// excluded token can never reach a grid even if upstream returns it.
pub struct FilteredCatalogue {
    inner: Box<dyn MarketCatalogue>,
    excluded: HashSet<String>,
}

impl FilteredCatalogue {
    pub fn new(inner: Box<dyn MarketCatalogue>, excluded_markets: &[String]) -> Self {
        Self {
            inner,
            excluded: excluded_markets.iter().cloned().collect(),
        }
    }

    #[instrument(skip(self))]
    pub async fn markets(&self) -> Result<Vec<Market>> {
        let markets = self.inner.markets().await?;
        let before = markets.len();
        let filtered: Vec<Market> = markets
            .into_iter()
            .filter(|m| !self.excluded.contains(&m.pool_id) && !self.excluded.contains(&m.base_token))
            .collect();

        if filtered.len() != before {
            debug!(excluded = before - filtered.len(), "filtered excluded markets from catalogue");
        }
        Ok(filtered)
    }

    /// Applied again at per-row ingest time, independent of the catalogue
    /// snapshot, since upstream rows may reference a pool id the catalogue
    /// itself never returned.
    pub fn is_excluded(&self, token_or_pool: &str) -> bool {
        self.excluded.contains(token_or_pool)
    }
}

/// A catalogue backed by a static, pre-fetched market list. Used in
/// development mode and in tests where chain-RPC discovery is unavailable.
pub struct StaticCatalogue {
    markets: Vec<Market>,
}

impl StaticCatalogue {
    pub fn new(markets: Vec<Market>) -> Self {
        Self { markets }
    }
}

#[async_trait]
impl MarketCatalogue for StaticCatalogue {
    async fn markets(&self) -> Result<Vec<Market>> {
        Ok(self.markets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(base: &str, pool: &str) -> Market {
        Market {
            base_token: base.to_string(),
            quote_token: "USDC".to_string(),
            pool_id: pool.to_string(),
            base_decimals: 9,
            quote_decimals: 6,
            base_symbol: None,
            base_name: None,
            target_symbol: None,
            target_name: None,
        }
    }

    #[tokio::test]
    async fn excludes_by_pool_id_and_base_token() {
        let inner = StaticCatalogue::new(vec![
            market("AAA", "pool-a"),
            market("BBB", "pool-b"),
            market("CCC", "pool-c"),
        ]);
        let excluded = vec!["pool-b".to_string(), "CCC".to_string()];
        let catalogue = FilteredCatalogue::new(Box::new(inner), &excluded);

        let markets = catalogue.markets().await.unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].base_token, "AAA");
        assert!(catalogue.is_excluded("pool-b"));
        assert!(!catalogue.is_excluded("pool-a"));
    }
}
