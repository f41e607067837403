//! HTTP endpoints for event submission and metric reads
//!
//! Every route resolves the batch pipeline through the shared
//! [`BatchManagerCell`], so the first request starts it when the service
//! did not do so eagerly.

use chrono::{DateTime, Duration, Utc};
use event_batcher::{AggregationStore, BatchError, BatchManagerCell, EventRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Largest accepted event body
const MAX_BODY_BYTES: u64 = 16 * 1024;

/// History window used when the caller gives no `from`
const DEFAULT_HISTORY_WINDOW_HOURS: i64 = 24;

/// Custom error for not found responses
#[derive(Debug)]
struct NotFoundError(ErrorResponse);

impl warp::reject::Reject for NotFoundError {}

/// Body of `POST /api/metrics/{metric_id}/events`
#[derive(Debug, Deserialize)]
pub struct SubmitEventBody {
    pub project_id: Uuid,
    #[serde(default)]
    pub add: i64,
    #[serde(default)]
    pub remove: i64,
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

/// Accepted event response
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitEventResponse {
    pub metric_id: Uuid,
    pub monthly_event_count: i64,
}

/// History query parameters, RFC 3339 timestamps
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    pub timestamp: String,
}

/// Error detail
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    fn new(code: &str, message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self {
            error: ErrorDetail { code: code.to_string(), message: message.into(), details },
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn into_reply(self, status: StatusCode) -> warp::reply::Response {
        warp::reply::with_status(warp::reply::json(&self), status).into_response()
    }
}

fn with_batcher<S: AggregationStore>(
    cell: Arc<BatchManagerCell<S>>,
) -> impl Filter<Extract = (Arc<BatchManagerCell<S>>,), Error = Infallible> + Clone {
    warp::any().map(move || cell.clone())
}

/// Map a pipeline outcome onto a status code and error body.
///
/// Overload, shutdown and transient store conflicts answer 503 with
/// `Retry-After` so clients back off.
pub fn batch_error_response(err: &BatchError, retry_after_secs: u64) -> warp::reply::Response {
    const INTERNAL: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

    let (status, code) = match err {
        BatchError::QueueSaturated { .. } => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_SATURATED"),
        BatchError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        BatchError::InvalidEvent(_) => (StatusCode::BAD_REQUEST, "INVALID_EVENT"),
        BatchError::Update { .. } => (StatusCode::BAD_REQUEST, "UPDATE_ERROR"),
        BatchError::MetricNotFound { .. } => (StatusCode::NOT_FOUND, "METRIC_NOT_FOUND"),
        BatchError::Storage { transient: true, .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "STORE_BUSY")
        }
        BatchError::Storage { .. } => (INTERNAL, "STORE_ERROR"),
        BatchError::FilterDecode { .. } => (INTERNAL, "FILTER_DECODE_ERROR"),
        BatchError::FilterProcess { .. } => (INTERNAL, "FILTER_PROCESS_ERROR"),
        BatchError::Insert { .. } => (INTERNAL, "HISTORY_INSERT_ERROR"),
        BatchError::ProjectUpdate { .. } => (INTERNAL, "PROJECT_UPDATE_ERROR"),
        BatchError::Transaction(_) => (INTERNAL, "TRANSACTION_ERROR"),
        BatchError::Commit(_) => (INTERNAL, "COMMIT_ERROR"),
        BatchError::UnhandledEvent => (INTERNAL, "UNHANDLED_EVENT"),
        BatchError::Config(_) => (INTERNAL, "CONFIG_ERROR"),
    };

    let details = serde_json::json!({
        "batch_wide": err.is_batch_wide(),
        "transient": err.is_transient(),
    });
    let response = ErrorResponse::new(code, err.to_string(), Some(details)).into_reply(status);

    if status == StatusCode::SERVICE_UNAVAILABLE {
        warp::reply::with_header(response, "Retry-After", retry_after_secs.to_string())
            .into_response()
    } else {
        response
    }
}

fn store_error_response(err: &event_batcher::StoreError) -> warp::reply::Response {
    ErrorResponse::new("STORE_ERROR", err.to_string(), None)
        .into_reply(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Submit one event and wait for its batch to commit
async fn submit_event<S: AggregationStore>(
    metric_id: Uuid,
    body: SubmitEventBody,
    cell: Arc<BatchManagerCell<S>>,
    retry_after_secs: u64,
) -> Result<warp::reply::Response, Rejection> {
    let manager = match cell.get_or_create().await {
        Ok(manager) => manager,
        Err(e) => return Ok(batch_error_response(&e, retry_after_secs)),
    };

    let request = EventRequest {
        metric_id,
        project_id: body.project_id,
        add: body.add,
        remove: body.remove,
        filters: body.filters,
    };

    match manager.submit_event(request).await {
        Ok(ack) => {
            debug!(%metric_id, monthly_event_count = ack.monthly_event_count, "Event committed");
            let response =
                SubmitEventResponse { metric_id, monthly_event_count: ack.monthly_event_count };
            Ok(warp::reply::json(&response).into_response())
        }
        Err(e) => {
            if e.is_batch_wide() {
                error!(%metric_id, error = %e, "Event lost with its batch");
            }
            Ok(batch_error_response(&e, retry_after_secs))
        }
    }
}

/// Current totals of a metric and its sub-metrics
async fn get_metric<S: AggregationStore>(
    metric_id: Uuid,
    cell: Arc<BatchManagerCell<S>>,
    retry_after_secs: u64,
) -> Result<warp::reply::Response, Rejection> {
    let manager = match cell.get_or_create().await {
        Ok(manager) => manager,
        Err(e) => return Ok(batch_error_response(&e, retry_after_secs)),
    };

    match manager.read_metric(metric_id).await {
        Ok(Some(summary)) => Ok(warp::reply::json(&summary).into_response()),
        Ok(None) => Err(warp::reject::custom(NotFoundError(ErrorResponse::new(
            "METRIC_NOT_FOUND",
            format!("Metric with ID '{}' not found", metric_id),
            Some(serde_json::json!({ "metric_id": metric_id })),
        )))),
        Err(e) => {
            error!(%metric_id, error = %e, "Failed to read metric");
            Ok(store_error_response(&e))
        }
    }
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, warp::reply::Response> {
    DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc)).map_err(|e| {
        ErrorResponse::new(
            "INVALID_TIMESTAMP",
            format!("'{}' is not an RFC 3339 timestamp: {}", field, e),
            Some(serde_json::json!({ field: value })),
        )
        .into_reply(StatusCode::BAD_REQUEST)
    })
}

/// Resolve `from`/`to`, defaulting to the last day
fn history_range(
    params: &HistoryParams,
) -> Result<(DateTime<Utc>, DateTime<Utc>), warp::reply::Response> {
    let to = match &params.to {
        Some(value) => parse_timestamp("to", value)?,
        None => Utc::now(),
    };
    let from = match &params.from {
        Some(value) => parse_timestamp("from", value)?,
        None => to - Duration::hours(DEFAULT_HISTORY_WINDOW_HOURS),
    };

    if from >= to {
        return Err(ErrorResponse::new(
            "INVALID_RANGE",
            "'from' must be earlier than 'to'",
            Some(serde_json::json!({ "from": from.to_rfc3339(), "to": to.to_rfc3339() })),
        )
        .into_reply(StatusCode::BAD_REQUEST));
    }

    Ok((from, to))
}

/// History buckets of a metric within `[from, to)`
async fn get_history<S: AggregationStore>(
    metric_id: Uuid,
    params: HistoryParams,
    cell: Arc<BatchManagerCell<S>>,
    retry_after_secs: u64,
) -> Result<warp::reply::Response, Rejection> {
    let (from, to) = match history_range(&params) {
        Ok(range) => range,
        Err(response) => return Ok(response),
    };

    let manager = match cell.get_or_create().await {
        Ok(manager) => manager,
        Err(e) => return Ok(batch_error_response(&e, retry_after_secs)),
    };

    match manager.read_history(metric_id, from, to).await {
        Ok(buckets) => Ok(warp::reply::json(&buckets).into_response()),
        Err(e) => {
            error!(%metric_id, error = %e, "Failed to read metric history");
            Ok(store_error_response(&e))
        }
    }
}

/// Pipeline counters and queue state
async fn get_stats<S: AggregationStore>(
    cell: Arc<BatchManagerCell<S>>,
) -> Result<warp::reply::Response, Rejection> {
    let body = match cell.get() {
        Some(manager) => serde_json::json!({
            "started": true,
            "queue_depth": manager.queue_depth(),
            "queue_capacity": manager.config().queue_capacity,
            "shutting_down": manager.is_shutting_down(),
            "draining": manager.is_draining(),
            "metrics": manager.metrics(),
        }),
        None => serde_json::json!({
            "started": false,
            "queue_depth": 0,
            "queue_capacity": cell.config().queue_capacity,
            "shutting_down": false,
            "draining": false,
            "metrics": null,
        }),
    };
    Ok(warp::reply::json(&body).into_response())
}

/// Render rejections in the same error format as handler failures
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    if let Some(NotFoundError(response)) = err.find::<NotFoundError>() {
        return Ok(warp::reply::with_status(warp::reply::json(response), StatusCode::NOT_FOUND));
    }

    let (status, response) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, ErrorResponse::new("NOT_FOUND", "Route not found", None))
    } else if let Some(e) = err.find::<warp::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, ErrorResponse::new("INVALID_BODY", e.to_string(), None))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, ErrorResponse::new("INVALID_QUERY", e.to_string(), None))
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorResponse::new(
                "PAYLOAD_TOO_LARGE",
                format!("Body exceeds {} bytes", MAX_BODY_BYTES),
                None,
            ),
        )
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            ErrorResponse::new("LENGTH_REQUIRED", "Content-Length header required", None),
        )
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorResponse::new("UNSUPPORTED_MEDIA_TYPE", "Expected application/json", None),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorResponse::new("METHOD_NOT_ALLOWED", "Method not allowed", None),
        )
    } else {
        warn!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::new("INTERNAL_ERROR", "Internal server error", None),
        )
    };

    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}

/// All service routes
pub fn routes<S: AggregationStore>(
    cell: Arc<BatchManagerCell<S>>,
    retry_after_secs: u64,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let submit = warp::path!("api" / "metrics" / Uuid / "events")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_batcher(cell.clone()))
        .and_then(
            move |metric_id: Uuid, body: SubmitEventBody, cell: Arc<BatchManagerCell<S>>| {
                submit_event(metric_id, body, cell, retry_after_secs)
            },
        );

    let metric = warp::path!("api" / "metrics" / Uuid)
        .and(warp::get())
        .and(with_batcher(cell.clone()))
        .and_then(move |metric_id: Uuid, cell: Arc<BatchManagerCell<S>>| {
            get_metric(metric_id, cell, retry_after_secs)
        });

    let history = warp::path!("api" / "metrics" / Uuid / "history")
        .and(warp::get())
        .and(warp::query::<HistoryParams>())
        .and(with_batcher(cell.clone()))
        .and_then(
            move |metric_id: Uuid, params: HistoryParams, cell: Arc<BatchManagerCell<S>>| {
                get_history(metric_id, params, cell, retry_after_secs)
            },
        );

    let stats = warp::path!("api" / "stats")
        .and(warp::get())
        .and(with_batcher(cell))
        .and_then(|cell: Arc<BatchManagerCell<S>>| get_stats(cell));

    // Health check endpoint
    let health = warp::path("health").and(warp::path::end()).and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339()
        }))
    });

    submit.or(metric).or(history).or(stats).or(health).recover(handle_rejection)
}
