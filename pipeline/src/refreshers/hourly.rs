use crate::model::Grid;
use crate::store::BucketStore;
use async_trait::async_trait;
use pipeline_core::Result;
use std::sync::Arc;
use tracing::instrument;

use super::Refresher;

/// Keeps the hourly grid consistent with the 10-minute grid. Runs at two
/// cadences: a lightweight re-aggregate of the currently open hour every
/// 10-minute boundary, and a sealing pass just after each hour closes.
pub struct HourlyAggregator {
    store: Arc<BucketStore>,
}

impl HourlyAggregator {
    pub fn new(store: Arc<BucketStore>) -> Self {
        Self { store }
    }

    /// Re-aggregates the currently open hour, writing `is_complete = false`.
    #[instrument(skip(self))]
    pub async fn refresh_open_hour(&self) -> Result<usize> {
        let now = Grid::Hourly.align(chrono::Utc::now());
        self.store.aggregate_10min_to_hourly(None, Some(now)).await
    }

    /// Re-aggregates the hour that just closed, writing `is_complete = true`.
    #[instrument(skip(self))]
    pub async fn seal_closed_hour(&self) -> Result<usize> {
        let closed = Grid::Hourly.align(chrono::Utc::now()) - chrono::Duration::hours(1);
        self.store.aggregate_10min_to_hourly(None, Some(closed)).await
    }

    /// Aggregates every currently incomplete hour, then seals everything
    /// older than the current open hour. Used on startup and force-refresh.
    #[instrument(skip(self))]
    pub async fn full_refresh(&self) -> Result<usize> {
        let count = self.store.aggregate_10min_to_hourly(None, None).await?;
        let current_open = Grid::Hourly.align(chrono::Utc::now());
        self.store.mark_complete(Grid::Hourly, current_open).await?;
        Ok(count)
    }
}

#[async_trait]
impl Refresher for HourlyAggregator {
    fn name(&self) -> &str {
        "hourly_aggregator"
    }

    async fn refresh(&self) -> Result<()> {
        self.refresh_open_hour().await?;
        Ok(())
    }
}
