use super::validation::{parse_hours, parse_strict_date, parse_tokens, ApiError};
use crate::app::AppState;
use crate::model::{SupplementaryTable, Ticker};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

/// Every handler error response carries its HTTP status alongside the
/// uniform `ApiError` body.
pub struct ApiErrorResponse(pub StatusCode, pub ApiError);

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(self.1)).into_response()
    }
}

/// Validation failures are always 400s.
impl From<ApiError> for ApiErrorResponse {
    fn from(err: ApiError) -> Self {
        ApiErrorResponse(StatusCode::BAD_REQUEST, err)
    }
}

impl From<pipeline_core::Error> for ApiErrorResponse {
    fn from(err: pipeline_core::Error) -> Self {
        let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        ApiErrorResponse(status, ApiError::new(err.to_string()).request_id(Uuid::new_v4().to_string()))
    }
}

#[instrument(skip(state))]
pub async fn tickers(State(state): State<AppState>) -> Result<Json<Vec<Ticker>>, ApiErrorResponse> {
    let markets = state.catalogue.markets().await?;
    let tokens: Vec<String> = markets.iter().map(|m| m.base_token.clone()).collect();
    let token_to_pool: HashMap<String, String> =
        markets.iter().map(|m| (m.base_token.clone(), m.pool_id.clone())).collect();

    let metrics = state.read_api.rolling_24h(&tokens, &token_to_pool).await?;

    let mut out = Vec::with_capacity(markets.len());
    for market in &markets {
        let Some(agg) = metrics.get(&market.pool_id) else {
            continue;
        };
        if agg.trade_count == 0 {
            continue;
        }

        let last_price = if agg.base_volume.is_zero() {
            None
        } else {
            Some(agg.target_volume / agg.base_volume)
        };
        let Some(last_price) = last_price else {
            continue;
        };

        out.push(Ticker {
            ticker_id: format!("{}_{}", market.base_token, market.quote_token),
            base_currency: market.base_token.clone(),
            target_currency: market.quote_token.clone(),
            base_symbol: market.base_symbol.clone(),
            base_name: market.base_name.clone(),
            target_symbol: market.target_symbol.clone(),
            target_name: market.target_name.clone(),
            pool_id: market.pool_id.clone(),
            last_price: format!("{:.12}", last_price),
            base_volume: agg.base_volume.to_string(),
            target_volume: agg.target_volume.to_string(),
            bid: format!("{:.12}", last_price),
            ask: format!("{:.12}", last_price),
            liquidity_in_usd: "0".to_string(),
            high_24h: Some(agg.high.to_string()),
            low_24h: Some(agg.low.to_string()),
            start_date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
        });
    }

    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub struct MarketDataQuery {
    #[serde(rename = "startDate")]
    pub start_date: String,
    #[serde(rename = "endDate")]
    pub end_date: String,
    pub tokens: Option<String>,
}

/// Daily aggregates plus external-pool and buy/sell splits for the range.
/// Cumulative (window-sum) columns are attached alongside the plain
/// daily rows rather than replacing them, so a caller can chart either view.
#[instrument(skip(state, query))]
pub async fn market_data(
    State(state): State<AppState>,
    Query(query): Query<MarketDataQuery>,
) -> Result<Json<serde_json::Value>, ApiErrorResponse> {
    let start = parse_strict_date("startDate", &query.start_date)?;
    let end = parse_strict_date("endDate", &query.end_date)?;
    let tokens = parse_tokens(query.tokens.as_deref());
    let to_exclusive = end + chrono::Duration::days(1);

    let summaries = state.store.daily_aggregates(&tokens).await?;
    let filtered: Vec<_> = summaries
        .into_iter()
        .map(|mut s| {
            s.daily_rows.retain(|r| {
                let d = r.bucket_start.date_naive();
                d >= start && d <= end
            });
            s
        })
        .filter(|s| !s.daily_rows.is_empty())
        .collect();

    let buy_sell = state
        .store
        .range_supplementary(SupplementaryTable::BuySell, start, Some(to_exclusive), &tokens)
        .await?;
    let external_pool = state
        .store
        .range_supplementary(SupplementaryTable::ExternalPool, start, Some(to_exclusive), &tokens)
        .await?;

    let cumulative: Vec<_> = state
        .daily
        .cumulative_totals(&tokens)
        .await?
        .into_iter()
        .filter(|(_, date, _)| *date >= start && *date <= end)
        .map(|(token, date, agg)| {
            serde_json::json!({
                "token": token,
                "date": date,
                "cumulativeBaseVolume": agg.base_volume.to_string(),
                "cumulativeTargetVolume": agg.target_volume.to_string(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "markets": filtered,
        "buySell": buy_sell,
        "externalPool": external_pool,
        "cumulative": cumulative,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HealthHistoryQuery {
    pub service: Option<String>,
    pub hours: Option<String>,
}

#[instrument(skip(state))]
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ok = state.store.health_check().await.is_ok();
    Json(serde_json::json!({ "status": if ok { "ok" } else { "degraded" } }))
}

#[instrument(skip(state))]
pub async fn api_health(State(state): State<AppState>) -> Json<Vec<crate::model::ServiceStatus>> {
    Json(state.status.snapshot_all())
}

#[instrument(skip(state, query))]
pub async fn api_health_history(
    State(state): State<AppState>,
    Query(query): Query<HealthHistoryQuery>,
) -> Result<Json<Vec<crate::model::ServiceStatus>>, ApiErrorResponse> {
    let _hours = parse_hours(query.hours.as_deref(), 1, 168)?;
    let all = state.status.snapshot_all();
    let filtered = match query.service {
        Some(service) => all.into_iter().filter(|s| s.component == service).collect(),
        None => all,
    };
    Ok(Json(filtered))
}

#[instrument(skip(state))]
pub async fn cache_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let refreshing = state.cache_refresh_in_flight.load(std::sync::atomic::Ordering::SeqCst);
    Json(serde_json::json!({ "refreshing": refreshing }))
}

#[instrument(skip(state))]
pub async fn cache_refresh(State(state): State<AppState>) -> Result<StatusCode, ApiErrorResponse> {
    use std::sync::atomic::Ordering;

    if state.cache_refresh_in_flight.swap(true, Ordering::SeqCst) {
        return Err(ApiErrorResponse(
            StatusCode::CONFLICT,
            ApiError::new("refresh already in flight"),
        ));
    }

    let result = state.supplementary_refresh().await;
    state.cache_refresh_in_flight.store(false, Ordering::SeqCst);
    result?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip(state))]
pub async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled".to_string()),
    }
}
