use crate::analytics::{AnalyticsClient, HttpAnalyticsBackend};
use crate::catalogue::{FilteredCatalogue, StaticCatalogue};
use crate::model::Market;
use crate::read_api::MetricsReadAPI;
use crate::refreshers::{DailyAggregator, HourlyAggregator, Refresher, SupplementaryFetcher, TenMinuteRefresher};
use crate::scheduler::{Discipline, Scheduler};
use crate::status::StatusReporter;
use crate::store::BucketStore;
use metrics_exporter_prometheus::PrometheusHandle;
use pipeline_core::{Config, Result};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Shared, cloneable handle injected into every HTTP handler. Construction
/// happens once in `App::new`; handlers never reach past it into the
/// refreshers or scheduler directly.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BucketStore>,
    pub catalogue: Arc<FilteredCatalogue>,
    pub read_api: Arc<MetricsReadAPI>,
    pub daily: Arc<DailyAggregator>,
    pub status: StatusReporter,
    pub cache_refresh_in_flight: Arc<AtomicBool>,
    pub metrics_handle: Option<PrometheusHandle>,
    supplementary: Arc<Vec<Arc<SupplementaryFetcher>>>,
}

impl AppState {
    /// Forces a supplementary snapshot refresh across every registered
    /// supplementary fetcher; used by `POST /api/cache/refresh`.
    pub async fn supplementary_refresh(&self) -> Result<()> {
        for fetcher in self.supplementary.iter() {
            fetcher.refresh().await?;
        }
        Ok(())
    }
}

/// Composition root: constructs every component eagerly and hands handles
/// down. Nothing here is a lazily-initialised singleton; lifetime of every
/// handle matches the process.
pub struct App {
    config: Config,
    store: Arc<BucketStore>,
    scheduler: Scheduler,
    state: AppState,
    ten_minute: Arc<TenMinuteRefresher>,
    hourly: Arc<HourlyAggregator>,
    daily: Arc<DailyAggregator>,
    supplementary: Vec<Arc<SupplementaryFetcher>>,
}

impl App {
    #[instrument(skip(config, pool, metrics_handle))]
    pub async fn new(config: Config, pool: PgPool, metrics_handle: Option<PrometheusHandle>) -> Result<Self> {
        info!("initializing application");

        let store = Arc::new(BucketStore::new(pool));
        store.health_check().await?;

        let status = StatusReporter::new();
        for component in [
            "ten_minute_refresher",
            "hourly_aggregator",
            "daily_aggregator",
            "buy_sell_fetcher",
            "external_pool_fetcher",
            "bucket_store",
        ] {
            status.register(component);
        }

        let catalogue = Arc::new(build_catalogue(&config));

        let analytics = build_analytics_client(&config)?;

        let ten_minute = Arc::new(TenMinuteRefresher::new(
            Arc::clone(&store),
            Arc::clone(&analytics),
            Arc::clone(&catalogue),
            &config,
        ));
        let hourly = Arc::new(HourlyAggregator::new(Arc::clone(&store)));
        let daily = Arc::new(DailyAggregator::new(Arc::clone(&store)));

        let buy_sell = Arc::new(SupplementaryFetcher::new(
            Arc::clone(&store),
            Arc::clone(&analytics),
            crate::model::SupplementaryTable::BuySell,
            config.analytics.buy_sell_query_id.clone(),
            &config,
            HashMap::new(),
        ));
        let external_pool = Arc::new(SupplementaryFetcher::new(
            Arc::clone(&store),
            Arc::clone(&analytics),
            crate::model::SupplementaryTable::ExternalPool,
            config.analytics.external_pool_query_id.clone(),
            &config,
            load_owner_to_token_map(),
        ));
        let supplementary = vec![buy_sell, external_pool];

        let read_api = Arc::new(MetricsReadAPI::new(
            Arc::clone(&store),
            ten_minute.degradation_ring(),
            status.clone(),
        ));

        let state = AppState {
            store: Arc::clone(&store),
            catalogue,
            read_api,
            daily: Arc::clone(&daily),
            status,
            cache_refresh_in_flight: Arc::new(AtomicBool::new(false)),
            metrics_handle,
            supplementary: Arc::new(supplementary.clone()),
        };

        Ok(Self {
            config,
            store,
            scheduler: Scheduler::new(),
            state,
            ten_minute,
            hourly,
            daily,
            supplementary,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Exposed for the CLI's `backfill` subcommand, which drives the
    /// ten-minute grid directly rather than through the scheduler.
    pub fn ten_minute_refresher(&self) -> &TenMinuteRefresher {
        &self.ten_minute
    }

    /// Runs every refresher's startup/backfill path once before scheduling
    /// recurring jobs. Tolerates partial failure: a component that fails to
    /// bootstrap is marked degraded but does not abort the others — startup
    /// never fails hard on missing optional services.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) {
        if let Err(e) = self.ten_minute.initialize().await {
            warn!(error = %e, "ten-minute refresher bootstrap failed, degrading");
            self.state.status.mark_degraded("ten_minute_refresher", true);
        }
        self.state.status.mark_initialized("ten_minute_refresher");

        if let Err(e) = self.hourly.full_refresh().await {
            warn!(error = %e, "hourly aggregator bootstrap failed, degrading");
            self.state.status.mark_degraded("hourly_aggregator", true);
        }
        self.state.status.mark_initialized("hourly_aggregator");

        if let Err(e) = self.daily.full_refresh().await {
            warn!(error = %e, "daily aggregator bootstrap failed, degrading");
            self.state.status.mark_degraded("daily_aggregator", true);
        }
        self.state.status.mark_initialized("daily_aggregator");

        for fetcher in &self.supplementary {
            if let Err(e) = fetcher.initialize().await {
                warn!(error = %e, component = fetcher.name(), "supplementary fetcher bootstrap failed, degrading");
                self.state.status.mark_degraded(fetcher.name(), true);
            }
            self.state.status.mark_initialized(fetcher.name());
        }
    }

    /// Spawns every named recurring job at its own cadence. Each job is
    /// single-flighted by the scheduler itself; errors are logged and never
    /// propagate out of the loop.
    pub fn spawn_jobs(&mut self) {
        let sched = &self.config.scheduler;

        spawn_refresher_job(
            &mut self.scheduler,
            "ten_minute_refresher",
            Discipline::WallClockBoundary {
                boundary_minutes: sched.ten_minute_boundary_minutes,
                buffer: Duration::from_secs(sched.ten_minute_buffer_secs as u64),
            },
            Arc::clone(&self.ten_minute) as Arc<dyn Refresher>,
            self.state.status.clone(),
        );

        let hourly_refresh = Arc::clone(&self.hourly);
        let hourly_status = self.state.status.clone();
        self.scheduler.spawn(
            "hourly_aggregator_open",
            Discipline::WallClockBoundary {
                boundary_minutes: sched.ten_minute_boundary_minutes,
                buffer: Duration::from_secs(sched.ten_minute_buffer_secs as u64),
            },
            Box::new(move || {
                let hourly = Arc::clone(&hourly_refresh);
                let status = hourly_status.clone();
                Box::pin(async move {
                    status.mark_refreshing("hourly_aggregator", true);
                    let result = hourly.refresh_open_hour().await;
                    status.mark_refreshing("hourly_aggregator", false);
                    result.map(|_| ())
                })
            }),
        );

        let hourly_seal = Arc::clone(&self.hourly);
        self.scheduler.spawn(
            "hourly_aggregator_seal",
            Discipline::WallClockBoundary {
                boundary_minutes: 60,
                buffer: Duration::from_secs(sched.hourly_seal_minute as u64 * 60),
            },
            Box::new(move || {
                let hourly = Arc::clone(&hourly_seal);
                Box::pin(async move { hourly.seal_closed_hour().await.map(|_| ()) })
            }),
        );

        let (daily_hour, daily_minute) = parse_hh_mm(&sched.daily_seal_utc);
        let daily_seal = Arc::clone(&self.daily);
        self.scheduler.spawn(
            "daily_aggregator_seal",
            Discipline::DailyUtc { hour: daily_hour, minute: daily_minute },
            Box::new(move || {
                let daily = Arc::clone(&daily_seal);
                Box::pin(async move { daily.seal_yesterday().await.map(|_| ()) })
            }),
        );

        let (supp_hour, supp_minute) = parse_hh_mm(&sched.supplementary_fetch_utc);
        for fetcher in &self.supplementary {
            spawn_refresher_job(
                &mut self.scheduler,
                fetcher.name(),
                Discipline::DailyUtc { hour: supp_hour, minute: supp_minute },
                Arc::clone(fetcher) as Arc<dyn Refresher>,
                self.state.status.clone(),
            );
        }

        let store = Arc::clone(&self.store);
        let retention = self.config.retention.clone();
        self.scheduler.spawn(
            "retention_pruner",
            Discipline::FixedInterval { interval: Duration::from_secs(sched.prune_interval_secs) },
            Box::new(move || {
                let store = Arc::clone(&store);
                let retention = retention.clone();
                Box::pin(async move { run_pruning(&store, &retention).await })
            }),
        );
    }

    /// Stops every scheduled job and waits (bounded) for in-flight runs to
    /// finish, then closes the database pool.
    pub async fn shutdown(self) {
        self.scheduler.shutdown(Duration::from_secs(self.config.scheduler.shutdown_timeout_secs)).await;
        self.store.close().await;
    }
}

fn spawn_refresher_job(
    scheduler: &mut Scheduler,
    name: &str,
    discipline: Discipline,
    refresher: Arc<dyn Refresher>,
    status: StatusReporter,
) {
    let component = name.to_string();
    scheduler.spawn(
        name,
        discipline,
        Box::new(move || {
            let refresher = Arc::clone(&refresher);
            let status = status.clone();
            let component = component.clone();
            Box::pin(async move {
                status.mark_refreshing(&component, true);
                let result = refresher.refresh().await;
                status.mark_refreshing(&component, false);
                result
            })
        }),
    );
}

async fn run_pruning(store: &BucketStore, retention: &pipeline_core::config::RetentionConfig) -> Result<()> {
    use crate::model::Grid;
    use chrono::{Duration as ChronoDuration, Utc};

    let ten_min_cutoff = Utc::now() - ChronoDuration::hours(retention.ten_minute_hours);
    let hourly_cutoff = Utc::now() - ChronoDuration::hours(retention.hourly_hours);

    store.prune_before(Grid::TenMinute, ten_min_cutoff).await?;
    store.prune_before(Grid::Hourly, hourly_cutoff).await?;
    // The daily grid has no retention cutoff: it is kept indefinitely.
    Ok(())
}

fn build_analytics_client(config: &Config) -> Result<Arc<AnalyticsClient>> {
    let backend: Box<dyn crate::analytics::AnalyticsBackend> = match &config.analytics.api_key {
        Some(key) if !config.analytics.dev_mode => Box::new(HttpAnalyticsBackend::new(
            config.analytics.base_url.clone(),
            key.clone(),
            Duration::from_secs(config.analytics.fetch_timeout_secs),
        )?),
        _ => {
            info!("analytics API key absent or DEV_MODE set: upstream fetches are disabled");
            Box::new(NullAnalyticsBackend)
        }
    };
    Ok(Arc::new(AnalyticsClient::new(backend, config)))
}

/// Stands in for the chain-RPC market discovery this pipeline treats as an
/// external `MarketCatalogue` collaborator. Reads a static snapshot
/// from `MARKET_CATALOGUE_JSON` when set; otherwise starts empty and relies
/// on an operator to provision markets through that external system.
fn build_catalogue(config: &Config) -> FilteredCatalogue {
    let markets = std::env::var("MARKET_CATALOGUE_JSON")
        .ok()
        .and_then(|raw| serde_json::from_str::<Vec<Market>>(&raw).ok())
        .unwrap_or_default();
    FilteredCatalogue::new(Box::new(StaticCatalogue::new(markets)), &config.catalogue.excluded_markets)
}

/// Owner-address-to-base-token resolution for the external-pool source.
/// Loaded the same way as the catalogue snapshot: a static mapping
/// an operator provisions out of band, not chain-RPC derived here.
fn load_owner_to_token_map() -> HashMap<String, String> {
    std::env::var("EXTERNAL_POOL_OWNER_MAP_JSON")
        .ok()
        .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(&raw).ok())
        .unwrap_or_default()
}

fn parse_hh_mm(raw: &str) -> (u32, u32) {
    let mut parts = raw.splitn(2, ':');
    let hour = parts.next().and_then(|h| h.parse().ok()).unwrap_or(0);
    let minute = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    (hour, minute)
}

/// Backend used when no analytics credentials are configured. Every call
/// fails as `StorageUnavailable`-shaped transient noise that refreshers
/// already swallow at the top of their refresh loop; the store keeps
/// serving whatever history it already has from its in-memory fallback.
struct NullAnalyticsBackend;

#[async_trait::async_trait]
impl crate::analytics::AnalyticsBackend for NullAnalyticsBackend {
    async fn submit(&self, _query_id: &str, _params: &HashMap<String, String>) -> Result<String> {
        Err(pipeline_core::Error::UpstreamTransient("analytics backend disabled".into()))
    }

    async fn poll_status(&self, _execution_id: &str) -> Result<crate::analytics::ExecutionStatus> {
        Err(pipeline_core::Error::UpstreamTransient("analytics backend disabled".into()))
    }

    async fn fetch_results(&self, _execution_id: &str) -> Result<crate::model::QueryResult> {
        Err(pipeline_core::Error::UpstreamTransient("analytics backend disabled".into()))
    }
}
