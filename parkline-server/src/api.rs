// Parkline Server - HTTP API, edge gateways and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! JSON API
//!
//! Every response uses the envelope
//! `{"success": bool, "data": ..., "error": ..., "code": ...}`. Failures carry
//! a machine-readable `code` and an HTTP status derived from the error kind:
//!
//! | code           | status |
//! |----------------|--------|
//! | `validation`   | 400    |
//! | `not_found`    | 404    |
//! | `conflict`     | 409    |
//! | `fatal`        | 500    |
//! | `sync_failure` | 503    |
//!
//! Operations that write the store run on the blocking pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use parkline::{
    BatchAck, Booking, BookingId, BookingStatus, LotId, LotSummary, ParkError, ParkingService,
    PricingSnapshot, SensorEvent, Slot, SlotId, SyncBatch, SystemStats, User, UserId,
};
use parkline_gateway::{EdgeGateway, GatewayError, GatewayStats};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::metrics::{self, BookingOutcome};

/// Application state shared across handlers.
pub struct AppState {
    pub service: Arc<ParkingService>,
    /// One gateway per lot
    pub gateways: BTreeMap<LotId, Arc<EdgeGateway>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<ParkingService>, gateways: BTreeMap<LotId, Arc<EdgeGateway>>) -> Self {
        Self {
            service,
            gateways,
            start_time: Instant::now(),
        }
    }

    fn gateway(&self, lot_id: LotId) -> Result<&Arc<EdgeGateway>, ApiError> {
        self.gateways
            .get(&lot_id)
            .ok_or_else(|| ParkError::not_found("gateway for lot", lot_id).into())
    }
}

// ============================================================================
// Envelope and errors
// ============================================================================

/// Response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T> Envelope<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }
}

/// A failed request
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "fatal",
            message: message.into(),
        }
    }
}

impl From<ParkError> for ApiError {
    fn from(err: ParkError) -> Self {
        let kind = err.kind();
        let status = match kind {
            parkline::ErrorKind::Validation => StatusCode::BAD_REQUEST,
            parkline::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            parkline::ErrorKind::Conflict => StatusCode::CONFLICT,
            parkline::ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if err.is_fatal() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            code: kind.code(),
            message: err.to_string(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        if err.is_sync_failure() {
            return Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "sync_failure",
                message: err.to_string(),
            };
        }
        error!(error = %err, "gateway failure");
        Self::internal(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.message),
            code: Some(self.code.to_string()),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<(StatusCode, Json<Envelope<T>>), ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(Envelope::ok(data))))
}

/// Run a store-writing operation off the async workers
async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&ParkingService) -> parkline::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let service = Arc::clone(&state.service);
    tokio::task::spawn_blocking(move || op(&service))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(ApiError::from)
}

// ============================================================================
// Router
// ============================================================================

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/parking-lots", get(list_lots))
        .route("/api/parking-lots/:lot_id", get(get_lot))
        .route("/api/parking-lots/:lot_id/events", post(ingest_event))
        .route("/api/parking-lots/:lot_id/gateway", get(gateway_stats))
        .route("/api/gateways", get(list_gateways))
        .route("/api/available-slots", get(available_slots))
        .route("/api/slots/:slot_id", get(slot_state))
        .route("/api/slots/:slot_id/service", post(set_service))
        .route("/api/pricing", get(current_pricing))
        .route("/api/stats", get(system_stats))
        .route("/api/users", get(list_users))
        .route("/api/users/:user_id/bookings", get(user_bookings))
        .route("/api/bookings", post(create_booking))
        .route("/api/bookings/:booking_id", get(get_booking))
        .route("/api/bookings/:booking_id/confirm", post(confirm_booking))
        .route("/api/bookings/:booking_id/complete", post(complete_booking))
        .route("/api/bookings/:booking_id/cancel", post(cancel_booking))
        .route("/api/sync/batches", post(apply_batch))
        .with_state(state)
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Parkline</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { margin: 10px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>Parkline</h1>
    <p>Parking occupancy, dynamic pricing and bookings.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div class="endpoint"><a href="/api/parking-lots">/api/parking-lots</a> - Lots with live counts</div>
        <div class="endpoint"><a href="/api/available-slots">/api/available-slots</a> - Free slots (<code>?lot_id=</code>)</div>
        <div class="endpoint"><a href="/api/pricing">/api/pricing</a> - Current rate per lot</div>
        <div class="endpoint"><a href="/api/stats">/api/stats</a> - System statistics</div>
        <div class="endpoint"><a href="/api/gateways">/api/gateways</a> - Gateway buffers and sync state</div>
        <div class="endpoint"><code>POST /api/bookings</code> - Book a slot</div>
        <div class="endpoint"><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div class="endpoint"><a href="/health">/health</a> - Health check</div>
    </div>
</body>
</html>"#,
    )
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    lots: usize,
    gateways: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> ApiResult<HealthStatus> {
    ok(HealthStatus {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        lots: state.service.coordinator().lots().count(),
        gateways: state.gateways.len(),
    })
}

/// Metrics handler - refreshes gauges, then returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    refresh_metrics(&state);
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        metrics::encode_metrics(),
    )
}

fn refresh_metrics(state: &AppState) {
    match state.service.list_lots() {
        Ok(lots) => lots.iter().for_each(metrics::update_lot),
        Err(e) => error!(error = %e, "failed to read lot counts"),
    }
    for snapshot in state.service.current_pricing() {
        metrics::update_pricing(&snapshot);
    }
    metrics::update_sync(&state.service.coordinator().stats());
    for gateway in state.gateways.values() {
        metrics::update_gateway(&gateway.stats());
    }
}

// ============================================================================
// Lots, slots and pricing
// ============================================================================

async fn list_lots(State(state): State<Arc<AppState>>) -> ApiResult<Vec<LotSummary>> {
    ok(state.service.list_lots()?)
}

async fn get_lot(
    State(state): State<Arc<AppState>>,
    lot_id: Result<Path<LotId>, PathRejection>,
) -> ApiResult<LotSummary> {
    let Path(lot_id) = lot_id?;
    ok(state.service.get_lot(lot_id)?)
}

#[derive(Debug, Deserialize)]
struct SlotFilter {
    lot_id: Option<LotId>,
}

async fn available_slots(
    State(state): State<Arc<AppState>>,
    filter: Result<Query<SlotFilter>, QueryRejection>,
) -> ApiResult<Vec<Slot>> {
    let Query(filter) = filter?;
    ok(state.service.available_slots(filter.lot_id)?)
}

async fn slot_state(
    State(state): State<Arc<AppState>>,
    slot_id: Result<Path<SlotId>, PathRejection>,
) -> ApiResult<Slot> {
    let Path(slot_id) = slot_id?;
    ok(state.service.slot_state(&slot_id)?)
}

#[derive(Debug, Deserialize)]
struct ServiceToggle {
    out_of_service: bool,
}

async fn set_service(
    State(state): State<Arc<AppState>>,
    slot_id: Result<Path<SlotId>, PathRejection>,
    body: Result<Json<ServiceToggle>, JsonRejection>,
) -> ApiResult<Slot> {
    let Path(slot_id) = slot_id?;
    let Json(toggle) = body?;
    let slot = blocking(&state, move |svc| {
        svc.set_out_of_service(&slot_id, toggle.out_of_service)
    })
    .await?;
    info!(slot = %slot.id, status = %slot.status, "slot service state changed");
    ok(slot)
}

async fn current_pricing(State(state): State<Arc<AppState>>) -> ApiResult<Vec<PricingSnapshot>> {
    ok(state.service.current_pricing())
}

async fn system_stats(State(state): State<Arc<AppState>>) -> ApiResult<SystemStats> {
    ok(state.service.system_stats()?)
}

async fn list_users(State(state): State<Arc<AppState>>) -> ApiResult<Vec<User>> {
    ok(state.service.list_users())
}

// ============================================================================
// Bookings
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateBooking {
    user_id: UserId,
    slot_id: SlotId,
    /// Signed: a negative value is a validation error
    duration_hours: i64,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateBooking>, JsonRejection>,
) -> ApiResult<Booking> {
    let Json(request) = body?;
    let result = match u32::try_from(request.duration_hours) {
        Ok(hours) => {
            blocking(&state, move |svc| {
                svc.create_booking(request.user_id, request.slot_id, hours)
            })
            .await
        }
        Err(_) => Err(ApiError::validation(format!(
            "Validation error: duration_hours is out of range, got {}",
            request.duration_hours
        ))),
    };

    match result {
        Ok(booking) => {
            metrics::record_booking(BookingOutcome::Created);
            Ok((StatusCode::CREATED, Json(Envelope::ok(booking))))
        }
        Err(err) => {
            match err.code {
                "conflict" => metrics::record_booking(BookingOutcome::Conflict),
                "validation" => metrics::record_booking(BookingOutcome::Rejected),
                _ => {}
            }
            Err(err)
        }
    }
}

async fn get_booking(
    State(state): State<Arc<AppState>>,
    booking_id: Result<Path<BookingId>, PathRejection>,
) -> ApiResult<Booking> {
    let Path(booking_id) = booking_id?;
    ok(state.service.get_booking(booking_id)?)
}

async fn confirm_booking(
    State(state): State<Arc<AppState>>,
    booking_id: Result<Path<BookingId>, PathRejection>,
) -> ApiResult<Booking> {
    let Path(booking_id) = booking_id?;
    let booking = blocking(&state, move |svc| svc.confirm_booking(booking_id)).await?;
    metrics::record_booking(BookingOutcome::Confirmed);
    ok(booking)
}

async fn complete_booking(
    State(state): State<Arc<AppState>>,
    booking_id: Result<Path<BookingId>, PathRejection>,
) -> ApiResult<Booking> {
    let Path(booking_id) = booking_id?;
    let booking = blocking(&state, move |svc| svc.complete_booking(booking_id)).await?;
    metrics::record_booking(BookingOutcome::Completed);
    ok(booking)
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    booking_id: Result<Path<BookingId>, PathRejection>,
) -> ApiResult<Booking> {
    let Path(booking_id) = booking_id?;
    let booking = blocking(&state, move |svc| svc.cancel_booking(booking_id)).await?;
    metrics::record_booking(BookingOutcome::Cancelled);
    ok(booking)
}

#[derive(Debug, Deserialize)]
struct BookingFilter {
    status: Option<String>,
}

async fn user_bookings(
    State(state): State<Arc<AppState>>,
    user_id: Result<Path<UserId>, PathRejection>,
    filter: Result<Query<BookingFilter>, QueryRejection>,
) -> ApiResult<Vec<Booking>> {
    let Path(user_id) = user_id?;
    let Query(filter) = filter?;
    let status = match filter.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(BookingStatus::parse(raw).ok_or_else(|| {
            ApiError::validation(format!("Validation error: unknown booking status {:?}", raw))
        })?),
    };
    ok(state.service.list_user_bookings(user_id, status)?)
}

// ============================================================================
// Sync and gateways
// ============================================================================

async fn apply_batch(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SyncBatch>, JsonRejection>,
) -> ApiResult<BatchAck> {
    let Json(batch) = body?;
    ok(blocking(&state, move |svc| svc.apply_batch(&batch)).await?)
}

#[derive(Debug, Deserialize)]
struct SensorReading {
    slot_id: SlotId,
    occupied: bool,
    sequence: u64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct IngestReceipt {
    gateway_id: parkline::GatewayId,
    buffered: usize,
    in_flight: usize,
}

/// Hand a sensor reading to the lot's gateway. Never waits on a sync.
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    lot_id: Result<Path<LotId>, PathRejection>,
    body: Result<Json<SensorReading>, JsonRejection>,
) -> ApiResult<IngestReceipt> {
    let Path(lot_id) = lot_id?;
    let Json(reading) = body?;
    let gateway = state.gateway(lot_id)?;

    let owner = state.service.coordinator().lot_of(&reading.slot_id)?;
    if owner != lot_id {
        return Err(ApiError::validation(format!(
            "Validation error: slot {} belongs to lot {}, not {}",
            reading.slot_id, owner, lot_id
        )));
    }

    let mut event = SensorEvent::new(
        reading.slot_id,
        reading.occupied,
        reading.sequence,
        gateway.id().clone(),
    );
    if let Some(timestamp) = reading.timestamp {
        event.timestamp = timestamp;
    }
    gateway.ingest(event)?;

    let stats = gateway.stats();
    Ok((
        StatusCode::ACCEPTED,
        Json(Envelope::ok(IngestReceipt {
            gateway_id: stats.gateway_id,
            buffered: stats.buffered,
            in_flight: stats.in_flight,
        })),
    ))
}

async fn gateway_stats(
    State(state): State<Arc<AppState>>,
    lot_id: Result<Path<LotId>, PathRejection>,
) -> ApiResult<GatewayStats> {
    let Path(lot_id) = lot_id?;
    ok(state.gateway(lot_id)?.stats())
}

async fn list_gateways(State(state): State<Arc<AppState>>) -> ApiResult<Vec<GatewayStats>> {
    ok(state.gateways.values().map(|g| g.stats()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use parkline::{
        BatchEntry, BatchId, GatewayId, LedgerConfig, MemoryRepository, Repository,
        ServiceConfig,
    };
    use parkline_gateway::{GatewayConfig, LocalTransport};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        ParkingService::provision(repo.as_ref(), &seed::lots(2, 3), &seed::users()).unwrap();
        let config = ServiceConfig {
            ledger: LedgerConfig::auto_confirming(),
            ..Default::default()
        };
        let service = Arc::new(ParkingService::open(repo, config).unwrap());
        let gateways = service
            .coordinator()
            .lots()
            .map(|lot| {
                let transport = Arc::new(LocalTransport::new(Arc::clone(&service)));
                let gateway =
                    EdgeGateway::new(GatewayConfig::for_gateway(lot.gateway_id.clone()), transport)
                        .unwrap();
                (lot.id, Arc::new(gateway))
            })
            .collect();
        Arc::new(AppState::new(service, gateways))
    }

    async fn call(
        state: &Arc<AppState>,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn book(state: &Arc<AppState>, user: u64, slot: &str, hours: i64) -> (StatusCode, Value) {
        call(
            state,
            Method::POST,
            "/api/bookings",
            Some(json!({ "user_id": user, "slot_id": slot, "duration_hours": hours })),
        )
        .await
    }

    #[tokio::test]
    async fn test_list_lots_with_counts() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/api/parking-lots", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let lots = body["data"].as_array().unwrap();
        assert_eq!(lots.len(), 2);
        assert_eq!(lots[0]["name"], "North Garage");
        assert_eq!(lots[0]["total"], 3);
        assert_eq!(lots[0]["free"], 3);
    }

    #[tokio::test]
    async fn test_unknown_lot_is_not_found() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/api/parking-lots/9", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_booking_conflict_vs_validation() {
        let state = state();
        let (status, body) = book(&state, 1, "F1-02", 2).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["status"], "Active");
        assert_eq!(body["data"]["slot_id"], "F1-02");

        let (status, body) = book(&state, 2, "F1-02", 1).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, body) = book(&state, 99, "F1-03", 1).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");

        let (status, body) = book(&state, 1, "F1-03", -3).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");

        let (status, body) = book(&state, 1, "F1-03", 0).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn test_oversized_duration_reports_range() {
        let state = state();
        let (status, body) = book(&state, 1, "F1-03", i64::from(u32::MAX) + 1).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
        let message = body["error"].as_str().unwrap();
        assert!(message.contains("out of range"));
        assert!(!message.contains("positive"));
    }

    #[tokio::test]
    async fn test_malformed_body_uses_envelope() {
        let state = state();
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/bookings",
            Some(json!({ "user_id": "one" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "validation");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_cancel_frees_slot_immediately() {
        let state = state();
        let (_, body) = book(&state, 1, "F1-01", 3).await;
        let id = body["data"]["id"].as_u64().unwrap();

        let (_, slots) = call(&state, Method::GET, "/api/available-slots?lot_id=1", None).await;
        assert_eq!(slots["data"].as_array().unwrap().len(), 2);

        let (status, body) = call(
            &state,
            Method::POST,
            &format!("/api/bookings/{}/cancel", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "Cancelled");

        let (_, slots) = call(&state, Method::GET, "/api/available-slots?lot_id=1", None).await;
        assert_eq!(slots["data"].as_array().unwrap().len(), 3);

        let (status, body) = call(
            &state,
            Method::POST,
            &format!("/api/bookings/{}/complete", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn test_get_unknown_booking() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/api/bookings/404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_user_bookings_filter() {
        let state = state();
        book(&state, 3, "F2-01", 1).await;
        let (_, body) = book(&state, 3, "F2-02", 1).await;
        let id = body["data"]["id"].as_u64().unwrap();
        call(&state, Method::POST, &format!("/api/bookings/{}/complete", id), None).await;

        let (_, all) = call(&state, Method::GET, "/api/users/3/bookings", None).await;
        assert_eq!(all["data"].as_array().unwrap().len(), 2);

        let (_, done) = call(
            &state,
            Method::GET,
            "/api/users/3/bookings?status=completed",
            None,
        )
        .await;
        let done = done["data"].as_array().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["id"].as_u64(), Some(id));

        let (status, body) = call(
            &state,
            Method::GET,
            "/api/users/3/bookings?status=parked",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn test_sync_batch_is_idempotent() {
        let state = state();
        let batch = SyncBatch {
            gateway_id: GatewayId::from("gw-remote"),
            batch_id: BatchId::from("r-1"),
            entries: vec![BatchEntry::Event(SensorEvent::new(
                "F2-03", true, 4, "gw-remote",
            ))],
        };
        let payload = serde_json::to_value(&batch).unwrap();

        let (status, ack) =
            call(&state, Method::POST, "/api/sync/batches", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["data"]["applied"], 1);
        assert_eq!(ack["data"]["duplicate"], false);

        let (_, ack) = call(&state, Method::POST, "/api/sync/batches", Some(payload)).await;
        assert_eq!(ack["data"]["duplicate"], true);

        let (_, slot) = call(&state, Method::GET, "/api/slots/F2-03", None).await;
        assert_eq!(slot["data"]["status"], "Occupied");
        assert_eq!(slot["data"]["last_sequence"], 4);
    }

    #[tokio::test]
    async fn test_ingest_goes_through_gateway() {
        let state = state();
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/parking-lots/1/events",
            Some(json!({ "slot_id": "F1-01", "occupied": true, "sequence": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["buffered"], 1);

        // buffered only until the gateway syncs
        let (_, slot) = call(&state, Method::GET, "/api/slots/F1-01", None).await;
        assert_eq!(slot["data"]["status"], "Free");

        let gateway = Arc::clone(&state.gateways[&LotId(1)]);
        gateway.sync_once().await.unwrap();
        let (_, slot) = call(&state, Method::GET, "/api/slots/F1-01", None).await;
        assert_eq!(slot["data"]["status"], "Occupied");

        let (_, stats) = call(&state, Method::GET, "/api/parking-lots/1/gateway", None).await;
        assert_eq!(stats["data"]["forwarded"], 1);
        assert_eq!(stats["data"]["gateway_id"], "gw-1");
    }

    #[tokio::test]
    async fn test_ingest_rejects_slot_of_other_lot() {
        let state = state();
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/parking-lots/1/events",
            Some(json!({ "slot_id": "F2-01", "occupied": true, "sequence": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn test_out_of_service_refused_while_reserved() {
        let state = state();
        book(&state, 1, "F1-03", 1).await;
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/slots/F1-03/service",
            Some(json!({ "out_of_service": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/slots/F1-02/service",
            Some(json!({ "out_of_service": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "OutOfService");
    }

    #[tokio::test]
    async fn test_stats_and_pricing() {
        let state = state();
        book(&state, 1, "F1-01", 2).await;

        let (_, stats) = call(&state, Method::GET, "/api/stats", None).await;
        assert_eq!(stats["data"]["total_slots"], 6);
        assert_eq!(stats["data"]["reserved_slots"], 1);
        assert_eq!(stats["data"]["bookings"]["active"], 1);

        let (_, pricing) = call(&state, Method::GET, "/api/pricing", None).await;
        let snapshots = pricing["data"].as_array().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots
            .iter()
            .all(|s| s["final_rate"].as_f64().unwrap() <= s["daily_cap"].as_f64().unwrap()));
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["gateways"], 2);

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(&state)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("parkline_lot_occupancy_ratio"));
        assert!(text.contains("parkline_gateway_buffered_events"));
    }
}
