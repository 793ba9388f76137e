use std::convert::Infallible;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use sensor_common::geofence::BoundingBox;
use sensor_common::store::{PgEventStore, StoreError};

use crate::feed::{BroadcastFeed, FeedEvent};
use crate::health::{HealthRegistry, HealthStatus};

pub const RECENT_EVENTS_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: PgEventStore,
    pub feed: Arc<BroadcastFeed>,
    pub liveness: HealthRegistry,
    pub sse_keepalive: Duration,
    /// Ends open streams so graceful shutdown does not wait on them.
    pub shutdown: CancellationToken,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .route("/api/v1/events", get(recent_events))
        .route("/api/v1/events/stream", get(stream_events))
        .with_state(state)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("bbox must be minLon,minLat,maxLon,maxLat (e.g. 56.0,37.2,73.2,45.6)")]
    InvalidBbox,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidBbox => StatusCode::BAD_REQUEST,
            ApiError::Store(err) => {
                error!(reason = %err, "failed to read events");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            ApiError::Store(_) => "storage error".to_owned(),
            other => other.to_string(),
        };

        (
            status,
            Json(json!({ "error": message, "code": status.as_u16() })),
        )
            .into_response()
    }
}

async fn index() -> &'static str {
    "sensor-ingest"
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

async fn readiness(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    sqlx::query("SELECT 1")
        .execute(state.store.pool())
        .await
        .map_err(|err| {
            warn!(reason = %err, "readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    Ok("ok")
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub bbox: Option<String>,
}

fn bbox_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^-?\d+(\.\d+)?,-?\d+(\.\d+)?,-?\d+(\.\d+)?,-?\d+(\.\d+)?$").ok()
        })
        .as_ref()
}

/// Parse `minLon,minLat,maxLon,maxLat`.
pub fn parse_bbox(raw: &str) -> Result<BoundingBox, ApiError> {
    let raw = raw.trim();
    if !bbox_pattern().is_some_and(|pattern| pattern.is_match(raw)) {
        return Err(ApiError::InvalidBbox);
    }

    let values = raw
        .split(',')
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ApiError::InvalidBbox)?;
    let [lng_min, lat_min, lng_max, lat_max] = values[..] else {
        return Err(ApiError::InvalidBbox);
    };

    BoundingBox::new(lng_min, lng_max, lat_min, lat_max).ok_or(ApiError::InvalidBbox)
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<FeedEvent>>, ApiError> {
    let bbox = query
        .bbox
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .map(parse_bbox)
        .transpose()?;

    let events = state.store.recent(bbox, RECENT_EVENTS_LIMIT).await?;

    Ok(Json(events.iter().map(FeedEvent::from).collect()))
}

/// Live feed of admitted events as Server-Sent Events named `event`.
async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.feed.subscribe())
        .filter_map(|item| {
            std::future::ready(match item {
                Ok(data) => Some(Ok(Event::default().event("event").data(&*data))),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "slow feed subscriber skipped events");
                    None
                }
            })
        })
        .take_until(state.shutdown.cancelled_owned());

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.sse_keepalive)
            .text("keepalive"),
    )
}
