use crate::model::{
    BucketAggregate, BucketRecord, DailyAggregateSummary, Grid, SupplementaryRecord, SupplementaryTable,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use pipeline_core::Result;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

const UPSERT_BATCH_SIZE: usize = 500;

/// Durable state for the three time grids, the two supplementary daily
/// tables, and a small key/value metadata table. Every grid-specific query
/// is built around `grid.table_name()` since the grid is a runtime
/// parameter; compile-time checked queries are used wherever the table is
/// fixed (metadata).
pub struct BucketStore {
    pool: PgPool,
}

impl BucketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Waits for in-flight queries to finish and closes every pooled
    /// connection. Called once, on graceful shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Batched upsert keyed by `(token, bucket_start)`. Batches of
    /// `UPSERT_BATCH_SIZE` rows each run inside their own transaction; a
    /// failed batch never partially commits. On conflict, numeric fields are
    /// overwritten and `is_complete` is OR'd with the existing value so a
    /// completed bucket is never demoted.
    #[instrument(skip(self, rows), fields(grid = %grid, rows = rows.len()))]
    pub async fn upsert(&self, grid: Grid, rows: &[BucketRecord], mark_complete: bool) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let table = grid.table_name();
        let mut total = 0usize;

        for batch in rows.chunks(UPSERT_BATCH_SIZE) {
            let valid: Vec<&BucketRecord> = batch.iter().filter(|r| r.is_valid()).collect();
            if valid.is_empty() {
                continue;
            }

            let mut tx = self.pool.begin().await?;

            for row in &valid {
                let sql = format!(
                    r#"
                    INSERT INTO {table} (
                        token, bucket_start, base_volume, target_volume, high, low, trade_count,
                        buy_volume, sell_volume, average_price, usdc_fees, token_fees, sell_volume_usdc,
                        is_complete, updated_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                    ON CONFLICT (token, bucket_start) DO UPDATE SET
                        base_volume = EXCLUDED.base_volume,
                        target_volume = EXCLUDED.target_volume,
                        high = EXCLUDED.high,
                        low = EXCLUDED.low,
                        trade_count = EXCLUDED.trade_count,
                        buy_volume = EXCLUDED.buy_volume,
                        sell_volume = EXCLUDED.sell_volume,
                        average_price = EXCLUDED.average_price,
                        usdc_fees = EXCLUDED.usdc_fees,
                        token_fees = EXCLUDED.token_fees,
                        sell_volume_usdc = EXCLUDED.sell_volume_usdc,
                        is_complete = {table}.is_complete OR EXCLUDED.is_complete,
                        updated_at = EXCLUDED.updated_at
                    "#
                );

                sqlx::query(&sql)
                    .bind(&row.token)
                    .bind(row.bucket_start)
                    .bind(row.base_volume)
                    .bind(row.target_volume)
                    .bind(row.high)
                    .bind(row.low)
                    .bind(row.trade_count)
                    .bind(row.buy_volume)
                    .bind(row.sell_volume)
                    .bind(row.average_price)
                    .bind(row.usdc_fees)
                    .bind(row.token_fees)
                    .bind(row.sell_volume_usdc)
                    .bind(mark_complete || row.is_complete)
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            total += valid.len();
        }

        metrics::counter!("bucket_store_upserts_total", "grid" => grid.to_string()).increment(total as u64);
        debug!(grid = %grid, upserted = total, "upserted bucket rows");
        Ok(total)
    }

    #[instrument(skip(self), fields(grid = %grid))]
    pub async fn mark_complete(&self, grid: Grid, before_bucket: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "UPDATE {table} SET is_complete = true, updated_at = $1 WHERE bucket_start < $2 AND is_complete = false",
            table = grid.table_name()
        );
        let result = sqlx::query(&sql)
            .bind(Utc::now())
            .bind(before_bucket)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(grid = %grid))]
    pub async fn prune_before(&self, grid: Grid, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!("DELETE FROM {table} WHERE bucket_start < $1", table = grid.table_name());
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(grid = %grid, deleted, cutoff = %cutoff, "pruned old bucket rows");
        }
        Ok(deleted)
    }

    pub async fn latest_bucket(&self, grid: Grid) -> Result<Option<DateTime<Utc>>> {
        let sql = format!("SELECT MAX(bucket_start) AS latest FROM {table}", table = grid.table_name());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("latest").ok())
    }

    pub async fn latest_complete_bucket(&self, grid: Grid) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MAX(bucket_start) AS latest FROM {table} WHERE is_complete = true",
            table = grid.table_name()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("latest").ok())
    }

    /// Reduces rows with `bucket_start >= now - 24h` per token. Empty
    /// `tokens` means "all tokens".
    #[instrument(skip(self, tokens), fields(grid = %grid))]
    pub async fn rolling_24h(&self, grid: Grid, tokens: &[String]) -> Result<HashMap<String, BucketAggregate>> {
        let since = Utc::now() - Duration::hours(24);
        let rows = self.range(grid, since, None, tokens).await?;

        let mut out: HashMap<String, BucketAggregate> = HashMap::new();
        for row in &rows {
            out.entry(row.token.clone()).or_default().fold(row);
        }
        Ok(out)
    }

    #[instrument(skip(self, tokens), fields(grid = %grid))]
    pub async fn range(
        &self,
        grid: Grid,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
        tokens: &[String],
    ) -> Result<Vec<BucketRecord>> {
        let table = grid.table_name();
        let mut sql = format!(
            "SELECT token, bucket_start, base_volume, target_volume, high, low, trade_count, \
             buy_volume, sell_volume, average_price, usdc_fees, token_fees, sell_volume_usdc, \
             is_complete, updated_at FROM {table} WHERE bucket_start >= $1"
        );
        let mut arg = 2;
        if to.is_some() {
            sql.push_str(&format!(" AND bucket_start < ${arg}"));
            arg += 1;
        }
        if !tokens.is_empty() {
            sql.push_str(&format!(" AND token = ANY(${arg})"));
        }
        sql.push_str(" ORDER BY token ASC, bucket_start ASC");

        let mut query = sqlx::query_as::<_, BucketRecord>(&sql).bind(from);
        if let Some(to) = to {
            query = query.bind(to);
        }
        if !tokens.is_empty() {
            query = query.bind(tokens);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Per-token summary over the whole daily grid history.
    #[instrument(skip(self, tokens))]
    pub async fn daily_aggregates(&self, tokens: &[String]) -> Result<Vec<DailyAggregateSummary>> {
        let rows = self
            .range(Grid::Daily, DateTime::<Utc>::MIN_UTC, None, tokens)
            .await?;

        let mut by_token: HashMap<String, Vec<BucketRecord>> = HashMap::new();
        for row in rows {
            by_token.entry(row.token.clone()).or_default().push(row);
        }

        let mut summaries = Vec::with_capacity(by_token.len());
        for (token, mut rows) in by_token {
            rows.sort_by_key(|r| r.bucket_start);
            let agg = BucketAggregate::from_rows(&rows);
            let first = rows.first().map(|r| r.bucket_start.date_naive());
            let last = rows.last().map(|r| r.bucket_start.date_naive());
            if let (Some(first_date), Some(last_date)) = (first, last) {
                summaries.push(DailyAggregateSummary {
                    token,
                    first_date,
                    last_date,
                    total_base_volume: agg.base_volume,
                    total_target_volume: agg.target_volume,
                    all_time_high: agg.high,
                    all_time_low_positive: agg.low,
                    trading_days: rows.len() as i64,
                    daily_rows: rows,
                });
            }
        }
        Ok(summaries)
    }

    /// Rolls the 10-minute grid up into the hourly grid. `hour` pins the
    /// rollup to a single aligned hour; `None` aggregates every hour covered
    /// by the 10-minute grid's current span.
    #[instrument(skip(self))]
    pub async fn aggregate_10min_to_hourly(&self, token: Option<&str>, hour: Option<DateTime<Utc>>) -> Result<usize> {
        let hours = match hour {
            Some(h) => vec![Grid::Hourly.align(h)],
            None => self.distinct_hours(token).await?,
        };

        let mut total = 0;
        for hour_start in hours {
            let hour_end = hour_start + Duration::hours(1);
            let tokens: Vec<String> = token.map(|t| vec![t.to_string()]).unwrap_or_default();
            let rows = self.range(Grid::TenMinute, hour_start, Some(hour_end), &tokens).await?;

            let mut by_token: HashMap<String, Vec<BucketRecord>> = HashMap::new();
            for row in rows {
                by_token.entry(row.token.clone()).or_default().push(row);
            }

            let is_sealed = hour_end <= Utc::now();
            let mut hourly_rows = Vec::with_capacity(by_token.len());
            for (token, rows) in by_token {
                let agg = BucketAggregate::from_rows(&rows);
                let mut record = BucketRecord::new(
                    token,
                    hour_start,
                    agg.base_volume,
                    agg.target_volume,
                    agg.high,
                    agg.low,
                    agg.trade_count,
                );
                record.is_complete = is_sealed;
                hourly_rows.push(record);
            }

            total += self.upsert(Grid::Hourly, &hourly_rows, is_sealed).await?;
        }

        Ok(total)
    }

    /// Same shape at the day granularity.
    #[instrument(skip(self))]
    pub async fn aggregate_hourly_to_daily(&self, date: Option<NaiveDate>) -> Result<usize> {
        let dates = match date {
            Some(d) => vec![d],
            None => self.distinct_dates().await?,
        };

        let mut total = 0;
        for date in dates {
            let day_start = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
            let day_end = day_start + Duration::days(1);
            let rows = self.range(Grid::Hourly, day_start, Some(day_end), &[]).await?;

            let mut by_token: HashMap<String, Vec<BucketRecord>> = HashMap::new();
            for row in rows {
                by_token.entry(row.token.clone()).or_default().push(row);
            }

            let is_sealed = day_end <= Utc::now();
            let mut daily_rows = Vec::with_capacity(by_token.len());
            for (token, rows) in by_token {
                let agg = BucketAggregate::from_rows(&rows);
                let mut record = BucketRecord::new(
                    token,
                    day_start,
                    agg.base_volume,
                    agg.target_volume,
                    agg.high,
                    agg.low,
                    agg.trade_count,
                );
                record.is_complete = is_sealed;
                daily_rows.push(record);
            }

            total += self.upsert(Grid::Daily, &daily_rows, is_sealed).await?;
        }

        Ok(total)
    }

    async fn distinct_hours(&self, token: Option<&str>) -> Result<Vec<DateTime<Utc>>> {
        let sql = if token.is_some() {
            "SELECT DISTINCT date_trunc('hour', bucket_start) AS hour FROM bucket_ten_minute WHERE token = $1 ORDER BY hour"
        } else {
            "SELECT DISTINCT date_trunc('hour', bucket_start) AS hour FROM bucket_ten_minute ORDER BY hour"
        };
        let mut query = sqlx::query(sql);
        if let Some(t) = token {
            query = query.bind(t);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().filter_map(|r| r.try_get("hour").ok()).collect())
    }

    async fn distinct_dates(&self) -> Result<Vec<NaiveDate>> {
        let rows = sqlx::query("SELECT DISTINCT date_trunc('day', bucket_start) AS day FROM bucket_hourly ORDER BY day")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.try_get::<DateTime<Utc>, _>("day").ok())
            .map(|d| d.date_naive())
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn metadata_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query!("SELECT value FROM sync_metadata WHERE key = $1", key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.value))
    }

    #[instrument(skip(self))]
    pub async fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query!(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
            key,
            value,
            Utc::now()
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upserts into a supplementary daily table (buy/sell split or
    /// external-pool volume), keyed by `(token, date)` rather than
    /// `(token, bucket_start)`.
    #[instrument(skip(self, rows), fields(table = ?table))]
    pub async fn upsert_supplementary(
        &self,
        table: SupplementaryTable,
        rows: &[SupplementaryRecord],
        mark_complete: bool,
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let table_name = table.table_name();
        let mut tx = self.pool.begin().await?;
        let mut total = 0;

        for row in rows {
            if row.buy_volume < Decimal::ZERO || row.sell_volume < Decimal::ZERO {
                warn!(token = %row.token, "dropping supplementary row with negative volume");
                continue;
            }

            let sql = format!(
                r#"
                INSERT INTO {table_name} (token, date, buy_volume, sell_volume, is_complete, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (token, date) DO UPDATE SET
                    buy_volume = EXCLUDED.buy_volume,
                    sell_volume = EXCLUDED.sell_volume,
                    is_complete = {table_name}.is_complete OR EXCLUDED.is_complete,
                    updated_at = EXCLUDED.updated_at
                "#
            );

            sqlx::query(&sql)
                .bind(&row.token)
                .bind(row.date)
                .bind(row.buy_volume)
                .bind(row.sell_volume)
                .bind(mark_complete || row.is_complete)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            total += 1;
        }

        tx.commit().await?;
        Ok(total)
    }

    pub async fn latest_supplementary_date(&self, table: SupplementaryTable) -> Result<Option<NaiveDate>> {
        let sql = format!("SELECT MAX(date) AS latest FROM {}", table.table_name());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("latest").ok())
    }

    pub async fn range_supplementary(
        &self,
        table: SupplementaryTable,
        from: NaiveDate,
        to: Option<NaiveDate>,
        tokens: &[String],
    ) -> Result<Vec<SupplementaryRecord>> {
        let table_name = table.table_name();
        let mut sql = format!(
            "SELECT token, date, buy_volume, sell_volume, is_complete, updated_at FROM {table_name} WHERE date >= $1"
        );
        let mut arg = 2;
        if to.is_some() {
            sql.push_str(&format!(" AND date < ${arg}"));
            arg += 1;
        }
        if !tokens.is_empty() {
            sql.push_str(&format!(" AND token = ANY(${arg})"));
        }
        sql.push_str(" ORDER BY token ASC, date ASC");

        let mut query = sqlx::query_as::<_, SupplementaryRecord>(&sql).bind(from);
        if let Some(to) = to {
            query = query.bind(to);
        }
        if !tokens.is_empty() {
            query = query.bind(tokens);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(token: &str, base: i64, high: i64, low: i64, trades: i64) -> BucketRecord {
        BucketRecord::new(
            token,
            Utc::now(),
            Decimal::from(base),
            Decimal::from(base * 10),
            Decimal::from(high),
            Decimal::from(low),
            trades,
        )
    }

    #[test]
    fn aggregate_fold_ignores_zero_low() {
        let rows = vec![row("T", 1, 10, 0, 1), row("T", 2, 12, 5, 2)];
        let agg = BucketAggregate::from_rows(&rows);
        assert_eq!(agg.base_volume, Decimal::from(3));
        assert_eq!(agg.high, Decimal::from(12));
        assert_eq!(agg.low, Decimal::from(5));
        assert_eq!(agg.trade_count, 3);
    }

    #[test]
    fn aggregate_fold_is_commutative() {
        let a = row("T", 1, 10, 4, 1);
        let b = row("T", 2, 12, 5, 2);

        let mut forward = BucketAggregate::default();
        forward.fold(&a);
        forward.fold(&b);

        let mut backward = BucketAggregate::default();
        backward.fold(&b);
        backward.fold(&a);

        assert_eq!(forward, backward);
    }

    #[test]
    fn grid_alignment() {
        let aligned = Utc::now().date_naive().and_hms_opt(13, 0, 0).unwrap().and_utc();
        assert!(Grid::Hourly.is_aligned(aligned));
        assert!(!Grid::Hourly.is_aligned(aligned + Duration::minutes(1)));
        assert_eq!(Grid::Hourly.align(aligned + Duration::minutes(10)), aligned);
    }

    #[test]
    fn invalid_record_rejected() {
        let mut bad = row("T", 1, 10, 4, 1);
        bad.base_volume = Decimal::from(-1);
        assert!(!bad.is_valid());
    }
}
