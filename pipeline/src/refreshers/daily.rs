use crate::model::{BucketAggregate, Grid};
use crate::store::BucketStore;
use async_trait::async_trait;
use pipeline_core::Result;
use std::sync::Arc;
use tracing::instrument;

use super::Refresher;

/// Same shape as `HourlyAggregator` at the day granularity, scheduled daily
/// at 00:05 UTC. Also exports cumulative (window-sum) volume/fee columns
/// alongside each daily row.
pub struct DailyAggregator {
    store: Arc<BucketStore>,
}

impl DailyAggregator {
    pub fn new(store: Arc<BucketStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn seal_yesterday(&self) -> Result<usize> {
        let yesterday = (chrono::Utc::now() - chrono::Duration::days(1)).date_naive();
        self.store.aggregate_hourly_to_daily(Some(yesterday)).await
    }

    #[instrument(skip(self))]
    pub async fn full_refresh(&self) -> Result<usize> {
        self.store.aggregate_hourly_to_daily(None).await
    }

    /// Cumulative totals per token, in ascending date order: a window-sum
    /// over every prior day, reset at each token boundary. Backs the
    /// read-optimised daily export's extended columns (cumulative fees,
    /// cumulative volumes).
    #[instrument(skip(self, tokens))]
    pub async fn cumulative_totals(
        &self,
        tokens: &[String],
    ) -> Result<Vec<(String, chrono::NaiveDate, BucketAggregate)>> {
        let rows = self
            .store
            .range(Grid::Daily, chrono::DateTime::<chrono::Utc>::MIN_UTC, None, tokens)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        let mut current_token: Option<String> = None;
        let mut running = BucketAggregate::default();
        for row in rows {
            if current_token.as_deref() != Some(row.token.as_str()) {
                current_token = Some(row.token.clone());
                running = BucketAggregate::default();
            }
            running.fold(&row);
            out.push((row.token.clone(), row.bucket_start.date_naive(), running));
        }
        Ok(out)
    }
}

#[async_trait]
impl Refresher for DailyAggregator {
    fn name(&self) -> &str {
        "daily_aggregator"
    }

    async fn refresh(&self) -> Result<()> {
        self.seal_yesterday().await?;
        Ok(())
    }
}
