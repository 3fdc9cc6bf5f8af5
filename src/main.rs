mod config;
mod http;
mod idempotency;
mod intake;
mod jobs;
mod metrics;
mod mockup;
mod models;
mod notify;
mod orchestrator;
mod review;
mod security;
mod storage;
mod store;
mod templates;
mod tokens;
mod transform;
mod unlock;
mod worker;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use intake::DirectOrderRequest;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, FlowError, FlowErrorKind, ImageView, OrderView};
use orchestrator::Fulfillment;
use review::RegenSource;
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "pawtraits.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let auth_state = AuthState::from_env();
    let fx = Fulfillment::from_env();
    let (queue, _worker) = jobs::JobQueue::spawn(fx.clone());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| format!("prometheus recorder: {err}"))?;
    let state = AppState {
        fx,
        queue,
        dedup: idempotency::EventDedup::from_env(),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let admin = Router::new()
        .route("/orders/{id}", get(admin_get_order))
        .route("/orders/{id}/generate", post(admin_requeue_batch))
        .route("/orders/{id}/mockups", post(admin_create_mockup))
        .route("/orders/{id}/unlock", post(admin_unlock))
        .route("/orders/{id}/fulfill", post(admin_fulfill))
        .route("/orders/{id}/tokens", post(admin_issue_token))
        .route("/tokens/revoke", post(admin_revoke_token))
        .route("/access-log", get(admin_access_log))
        .route("/images/{id}/approve", post(admin_approve))
        .route("/images/{id}/reject", post(admin_reject))
        .route("/images/approve_bulk", post(admin_approve_bulk))
        .route("/images/{id}/regenerate", post(admin_regenerate))
        .route("/jobs/{id}", get(admin_job_status))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/webhooks/orders", post(storefront_webhook))
        .route("/webhooks/payments", post(payment_webhook))
        .route("/orders", post(create_order))
        .route("/checkout", post(create_checkout_session))
        .route("/portal/{token}", get(portal_order))
        .route("/portal/{token}/select", post(portal_select))
        .route(
            "/portal/{token}/images/{image_id}/regenerate",
            post(portal_regenerate),
        )
        .nest("/admin", admin)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "pawtraits.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    fx: Fulfillment,
    queue: jobs::JobQueue,
    dedup: idempotency::EventDedup,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "pawtraits-api-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return plain_response(StatusCode::UNAUTHORIZED, "unauthorized".into());
        }
    }
    plain_response(StatusCode::OK, state.prometheus_handle.render())
}

fn plain_response(status: StatusCode, body: String) -> axum::http::Response<String> {
    axum::http::Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap_or_default()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4 * 1024 * 1024)
}

// -------- Intake --------

#[derive(Debug, Serialize)]
struct IntakeResponse {
    order_id: String,
    portal_url: String,
    job_id: String,
}

/// Storefront order webhook.
///
/// - Method: `POST`
/// - Path: `/webhooks/orders`
/// - Auth: `X-Storefront-Hmac-Sha256` over the raw body
///
/// Replays (same `X-Storefront-Webhook-Id`) are acknowledged without
/// creating a second order.
async fn storefront_webhook(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/webhooks/orders");
    let signature = header_value(&headers, "X-Storefront-Hmac-Sha256");
    if !intake::verify_webhook_signature(&config::STOREFRONT_WEBHOOK_SECRET, &body, &signature) {
        return Err(FlowError::unauthorized("intake", "storefront webhook signature mismatch").into());
    }

    if let Some(delivery_id) = headers
        .get("X-Storefront-Webhook-Id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        && !state.dedup.first_delivery("orders", delivery_id.trim()).await
    {
        info!(target = "pawtraits.api", delivery_id, "storefront webhook replay ignored");
        return Ok(Json(json!({ "status": "duplicate" })));
    }

    let receipt = intake::intake_storefront(&state.fx, &body, &signature).await?;
    let job_id = enqueue(&state, receipt.order_id).await?;
    Ok(Json(json!({
        "status": "accepted",
        "order_id": receipt.order_id,
        "job_id": job_id,
    })))
}

/// Direct order form intake.
///
/// - Method: `POST`
/// - Path: `/orders`
/// - Body: `DirectOrderRequest` (photo URL or inline base64)
async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<DirectOrderRequest>,
) -> Result<Json<IntakeResponse>, AppError> {
    crate::metrics::inc_requests("/orders");
    let receipt = intake::intake_direct(&state.fx, payload).await?;
    let job_id = enqueue(&state, receipt.order_id).await?;
    Ok(Json(IntakeResponse {
        order_id: receipt.order_id.to_string(),
        portal_url: receipt.portal_url,
        job_id,
    }))
}

async fn enqueue(state: &AppState, order_id: Uuid) -> Result<String, AppError> {
    let job_id = state
        .queue
        .enqueue_batch(order_id)
        .await
        .map_err(|err: ApiError| FlowError::internal("enqueue", err.error))?;
    Ok(job_id.to_string())
}

// -------- Payments --------

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    order_id: Uuid,
    #[serde(default)]
    intent: Option<String>,
}

async fn create_checkout_session(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<intake::CheckoutSession>, AppError> {
    crate::metrics::inc_requests("/checkout");
    let session = intake::create_checkout(&state.fx, payload.order_id, payload.intent).await?;
    Ok(Json(session))
}

/// Payment provider webhook.
///
/// Signature failures are rejected; everything past the signature is
/// acknowledged with 200 so the provider stops redelivering. Unlock
/// failures are logged for the manual retry path.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/webhooks/payments");
    let signature = header_value(&headers, "X-Payment-Signature");
    let event = intake::parse_payment_event(&body, &signature)?;

    if !state.dedup.first_delivery("payments", &event.event_id).await {
        info!(target = "pawtraits.api", event_id = %event.event_id, "payment webhook replay ignored");
        return Ok(Json(json!({ "status": "duplicate" })));
    }
    if !event.is_completed_unlock() {
        return Ok(Json(json!({ "status": "ignored" })));
    }

    // metadata presence is implied by is_completed_unlock
    let order_id = match &event.metadata {
        Some(metadata) => metadata.order_id,
        None => return Ok(Json(json!({ "status": "ignored" }))),
    };
    match unlock::unlock_bonus(&state.fx, order_id).await {
        Ok(report) => Ok(Json(json!({
            "status": "unlocked",
            "order_id": report.order_id,
            "rewritten": report.rewritten,
        }))),
        Err(err) => {
            warn!(
                target = "pawtraits.unlock",
                order_id = %order_id,
                event_id = %event.event_id,
                error = %err,
                "unlock failed, awaiting manual retry"
            );
            Ok(Json(json!({ "status": "unlock_failed" })))
        }
    }
}

fn header_value(headers: &axum::http::HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

// -------- Customer portal --------

async fn portal_order(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<OrderView>, AppError> {
    crate::metrics::inc_requests("/portal");
    let order_id = state.fx.tokens.validate(&token).await?;
    Ok(Json(order_view(&state, order_id, false).await?))
}

#[derive(Debug, Deserialize)]
struct SelectRequest {
    image_id: Uuid,
}

async fn portal_select(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(payload): Json<SelectRequest>,
) -> Result<Json<OrderView>, AppError> {
    crate::metrics::inc_requests("/portal/select");
    let order_id = state.fx.tokens.validate(&token).await?;
    state
        .fx
        .store
        .select_image(order_id, payload.image_id)
        .await
        .map_err(|err| FlowError::invalid_input("portal", err.to_string()))?;
    Ok(Json(order_view(&state, order_id, false).await?))
}

#[derive(Debug, Deserialize, Default)]
struct RegenerateRequest {
    #[serde(default)]
    feedback: Option<String>,
}

async fn portal_regenerate(
    State(state): State<AppState>,
    Path((token, image_id)): Path<(String, Uuid)>,
    Json(payload): Json<RegenerateRequest>,
) -> Result<Json<ImageView>, AppError> {
    crate::metrics::inc_requests("/portal/regenerate");
    let order_id = state.fx.tokens.validate(&token).await?;
    let owned = state
        .fx
        .store
        .get_image(image_id)
        .await
        .map_err(|err| FlowError::not_found("portal", err.to_string()))?;
    if owned.order_id != order_id {
        return Err(FlowError::unauthorized("portal", "image belongs to another order").into());
    }
    let image =
        review::regenerate(&state.fx, image_id, payload.feedback, RegenSource::Customer).await?;
    let order = state
        .fx
        .store
        .get_order(order_id)
        .await
        .map_err(|err| FlowError::internal("portal", err.to_string()))?;
    Ok(Json(ImageView::from_image(&image, order.bonus_unlocked)))
}

async fn order_view(state: &AppState, order_id: Uuid, admin: bool) -> Result<OrderView, AppError> {
    let order = state
        .fx
        .store
        .get_order(order_id)
        .await
        .map_err(|err| FlowError::not_found("orders", err.to_string()))?;
    let unlocked = admin || order.bonus_unlocked;
    let images = state
        .fx
        .store
        .images_for_order(order_id)
        .await
        .iter()
        .map(|image| ImageView::from_image(image, unlocked))
        .collect();
    Ok(OrderView {
        id: order.id,
        customer_name: order.customer_name,
        product_type: order.product_type,
        status: order.status,
        bonus_unlocked: order.bonus_unlocked,
        selected_image_id: order.selected_image_id,
        images,
    })
}

// -------- Admin / review --------

async fn admin_get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderView>, AppError> {
    crate::metrics::inc_requests("/admin/orders");
    Ok(Json(order_view(&state, id, true).await?))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

/// Re-queue the generation batch for an order; existing slots are
/// overwritten by display order.
async fn admin_requeue_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/admin/generate");
    state
        .fx
        .store
        .get_order(id)
        .await
        .map_err(|err| FlowError::not_found("enqueue", err.to_string()))?;
    let job_id = enqueue(&state, id).await?;
    Ok(Json(EnqueueResponse { job_id }))
}

async fn admin_approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<review::ReviewOutcome>, AppError> {
    crate::metrics::inc_requests("/admin/approve");
    Ok(Json(review::approve(&state.fx, id).await?))
}

async fn admin_reject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<review::ReviewOutcome>, AppError> {
    crate::metrics::inc_requests("/admin/reject");
    Ok(Json(review::reject(&state.fx, id).await?))
}

#[derive(Debug, Deserialize)]
struct BulkApproveRequest {
    image_ids: Vec<Uuid>,
}

async fn admin_approve_bulk(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<BulkApproveRequest>,
) -> Result<Json<Vec<review::ReviewOutcome>>, AppError> {
    crate::metrics::inc_requests("/admin/approve_bulk");
    auth.require_lead("review")?;
    Ok(Json(review::approve_bulk(&state.fx, &payload.image_ids).await?))
}

async fn admin_regenerate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RegenerateRequest>,
) -> Result<Json<ImageView>, AppError> {
    crate::metrics::inc_requests("/admin/regenerate");
    let image = review::regenerate(&state.fx, id, payload.feedback, RegenSource::Operator).await?;
    Ok(Json(ImageView::from_image(&image, true)))
}

#[derive(Debug, Deserialize)]
struct MockupRequest {
    product_type: String,
}

async fn admin_create_mockup(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<MockupRequest>,
) -> Result<Json<ImageView>, AppError> {
    crate::metrics::inc_requests("/admin/mockups");
    let record = mockup::create_mockup(&state.fx, id, &payload.product_type).await?;
    Ok(Json(ImageView::from_image(&record, true)))
}

/// Shipment-side closeout: `Ready -> Fulfilled`. Repeats are no-ops, any
/// other starting status is rejected by the transition table.
async fn admin_fulfill(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/fulfill");
    auth.require_lead("fulfill")?;
    let transitioned = state
        .fx
        .store
        .transition_order(id, models::OrderStatus::Fulfilled)
        .await
        .map_err(|err| match err {
            store::StoreError::OrderNotFound(_) => FlowError::not_found("fulfill", err.to_string()),
            other => FlowError::invalid_input("fulfill", other.to_string()),
        })?;
    Ok(Json(json!({
        "order_id": id,
        "transitioned": transitioned,
    })))
}

/// Manual unlock retry for payment-webhook failures.
async fn admin_unlock(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<unlock::UnlockReport>, AppError> {
    crate::metrics::inc_requests("/admin/unlock");
    auth.require_lead("unlock")?;
    Ok(Json(unlock::unlock_bonus(&state.fx, id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct IssueTokenRequest {
    #[serde(default)]
    ttl_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
struct IssueTokenResponse {
    token: String,
    portal_url: String,
}

/// Mint a fresh portal token for an order and store it as the order's
/// current access token. Earlier tokens stay valid until revoked.
async fn admin_issue_token(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<IssueTokenRequest>,
) -> Result<Json<IssueTokenResponse>, AppError> {
    crate::metrics::inc_requests("/admin/tokens");
    auth.require_lead("tokens")?;
    let ttl = payload
        .ttl_secs
        .filter(|v| *v > 0)
        .unwrap_or_else(config::token_ttl_secs);
    let token = state.fx.tokens.issue(id, ttl);
    let order = state
        .fx
        .store
        .update_order_with(id, |order| {
            order.access_token = Some(token.clone());
            order.clone()
        })
        .await
        .map_err(|err| FlowError::not_found("tokens", err.to_string()))?;
    Ok(Json(IssueTokenResponse {
        portal_url: notify::portal_link(&order),
        token,
    }))
}

#[derive(Debug, Deserialize)]
struct RevokeTokenRequest {
    token: String,
}

async fn admin_revoke_token(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<RevokeTokenRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/tokens/revoke");
    auth.require_lead("tokens")?;
    state.fx.tokens.revoke(&payload.token).await;
    Ok(Json(json!({ "status": "revoked" })))
}

/// Token access audit trail, newest entries last.
async fn admin_access_log(
    State(state): State<AppState>,
) -> Json<Vec<store::AccessLogEntry>> {
    crate::metrics::inc_requests("/admin/access-log");
    Json(state.fx.store.access_log().await)
}

async fn admin_job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    if let Some(info) = state.queue.get(id).await {
        Ok(Json(info))
    } else {
        Err(FlowError::not_found("jobs", "unknown job id").into())
    }
}

// -------- Error mapping --------

#[derive(Debug)]
enum AppError {
    Flow(FlowError),
}

impl From<FlowError> for AppError {
    fn from(value: FlowError) -> Self {
        Self::Flow(value)
    }
}

impl From<tokens::TokenError> for AppError {
    fn from(value: tokens::TokenError) -> Self {
        Self::Flow(FlowError::unauthorized("portal", value.to_string()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Flow(err) => {
                let status = match err.kind() {
                    FlowErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    FlowErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
                    FlowErrorKind::NotFound => StatusCode::NOT_FOUND,
                    FlowErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
