//! JSON read API over the listing store, plus an on-demand refresh trigger.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use estate_core::ListingFilter;
use estate_storage::ListingStore;
use estate_sync::RefreshPipeline;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "estate-web";

const DEFAULT_LISTING_LIMIT: usize = 100;
const MAX_LISTING_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ListingStore>,
    /// Absent when the server only reads.
    pub pipeline: Option<Arc<RefreshPipeline>>,
    pub reports_dir: Option<PathBuf>,
    refresh_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            pipeline: None,
            reports_dir: None,
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_pipeline(mut self, pipeline: RefreshPipeline) -> Self {
        self.pipeline = Some(Arc::new(pipeline));
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListingsQuery {
    city: Option<String>,
    min_price: Option<Decimal>,
    max_price: Option<Decimal>,
    min_area: Option<i64>,
    max_area: Option<i64>,
    limit: Option<usize>,
}

impl ListingsQuery {
    fn into_filter(self) -> ListingFilter {
        let limit = self.limit.unwrap_or(DEFAULT_LISTING_LIMIT).clamp(1, MAX_LISTING_LIMIT);
        ListingFilter {
            city: self.city.filter(|c| !c.trim().is_empty()),
            min_price: self.min_price,
            max_price: self.max_price,
            min_area: self.min_area,
            max_area: self.max_area,
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AveragesQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/listings", get(listings_handler))
        .route("/cities/average-price", get(average_price_handler))
        .route("/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable", "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn listings_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListingsQuery>) -> Response {
    let filter = query.into_filter();
    match state.store.query_listings(&filter).await {
        Ok(listings) => Json(serde_json::json!({
            "count": listings.len(),
            "listings": listings,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn average_price_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AveragesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(10).clamp(1, MAX_LISTING_LIMIT);
    match state.store.average_price_by_city(limit).await {
        Ok(cities) => Json(serde_json::json!({ "cities": cities })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = state.pipeline.clone() else {
        return error_json(StatusCode::SERVICE_UNAVAILABLE, "refresh is not enabled on this server");
    };
    let Ok(_guard) = state.refresh_lock.try_lock() else {
        return error_json(StatusCode::CONFLICT, "a refresh is already running");
    };

    let report = pipeline.run(CancellationToken::new()).await;
    if let Some(dir) = &state.reports_dir {
        if let Err(err) = report.write_json(dir).await {
            warn!(error = %err, run_id = %report.run_id, "could not persist run report");
        }
    }
    Json(report).into_response()
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}
