use crate::models::{ApiError, FlowError};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared state for the admin surface: reviewer API keys (with roles) and a
/// per-reviewer request budget.
#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, ReviewerRecord>>,
    budget: Arc<ReviewBudget>,
}

/// What a reviewer may do. `Lead` additionally covers the destructive
/// operations: bulk approval, manual unlock, fulfillment closeout, and token
/// issue/revocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReviewerRole {
    Reviewer,
    Lead,
}

impl ReviewerRole {
    fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "lead" => Some(Self::Lead),
            "reviewer" => Some(Self::Reviewer),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub reviewer_id: String,
    pub api_key_id: String,
    pub role: ReviewerRole,
}

impl AuthContext {
    pub fn require_lead(&self, stage: &'static str) -> Result<(), FlowError> {
        if self.role == ReviewerRole::Lead {
            Ok(())
        } else {
            Err(FlowError::unauthorized(stage, "lead reviewer role required"))
        }
    }
}

#[derive(Clone)]
struct ReviewerRecord {
    reviewer_id: String,
    api_key_id: String,
    role: ReviewerRole,
}

impl AuthState {
    pub fn from_env() -> Self {
        let records = Arc::new(load_keys_from_env());
        let budget = Arc::new(ReviewBudget::from_env());
        Self { records, budget }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            reviewer_id: record.reviewer_id.clone(),
            api_key_id: record.api_key_id.clone(),
            role: record.role,
        })
    }
}

/// Middleware for the review/admin routes: resolve the presented key to a
/// reviewer, debit their budget by the route's cost, and stash the context
/// for handlers (role checks happen per handler).
pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        let response =
            unauthorized_response("missing_api_key", "Provide X-Portrait-Key or Bearer token");
        return Ok(response);
    };

    let Some(context) = state.authenticate(&presented) else {
        let response = unauthorized_response("invalid_api_key", "Key not recognized");
        return Ok(response);
    };

    let cost = route_cost(request.uri().path());
    match state.budget.debit(&context.reviewer_id, cost).await {
        Ok(permit) => {
            request.extensions_mut().insert(context.clone());
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = too_many_requests("rate_limited", "Too many requests");
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

/// Generation-backed routes debit more than reads: a reviewer hammering
/// regenerate or mockups drains their budget faster than one paging through
/// orders.
const GENERATION_COST: f64 = 3.0;

fn route_cost(path: &str) -> f64 {
    if path.ends_with("/regenerate") || path.ends_with("/generate") || path.ends_with("/mockups")
    {
        GENERATION_COST
    } else {
        1.0
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Portrait-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn too_many_requests(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
}

/// REVIEWER_API_KEYS holds comma-separated entries, each either
/// `reviewer:key` (plain reviewer) or `reviewer:role:key` with
/// role in {reviewer, lead}.
fn load_keys_from_env() -> HashMap<String, ReviewerRecord> {
    let raw = env::var("REVIEWER_API_KEYS")
        .unwrap_or_else(|_| "demo-reviewer:lead:demo-key".to_string());
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_key_entry(trimmed) {
            Some((reviewer, role, secret)) => {
                let record = ReviewerRecord {
                    reviewer_id: reviewer.to_string(),
                    api_key_id: format!("key-{:02}", idx + 1),
                    role,
                };
                entries.insert(secret.to_string(), record);
            }
            None => warn!(
                target = "pawtraits.api",
                "ignored malformed REVIEWER_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "pawtraits.api",
            "REVIEWER_API_KEYS produced no keys; falling back to demo credentials"
        );
        entries.insert(
            "demo-key".to_string(),
            ReviewerRecord {
                reviewer_id: "demo-reviewer".to_string(),
                api_key_id: "key-01".to_string(),
                role: ReviewerRole::Lead,
            },
        );
    } else {
        info!(
            target = "pawtraits.api",
            key_count = entries.len(),
            "loaded reviewer API keys from env"
        );
    }

    entries
}

fn parse_key_entry(entry: &str) -> Option<(&str, ReviewerRole, &str)> {
    let parts: Vec<&str> = entry
        .split(':')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    match parts.as_slice() {
        &[reviewer, secret] => Some((reviewer, ReviewerRole::Reviewer, secret)),
        &[reviewer, role, secret] => {
            Some((reviewer, ReviewerRole::from_label(role)?, secret))
        }
        _ => None,
    }
}

/// Leaky-budget limiter per reviewer id. Refills continuously at
/// `rate_per_sec` up to `capacity`; each request debits its route cost.
#[derive(Clone)]
struct ReviewBudget {
    rate_per_sec: f64,
    capacity: f64,
    accounts: Arc<Mutex<HashMap<String, BudgetState>>>,
}

impl ReviewBudget {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= GENERATION_COST)
            .unwrap_or(10.0);
        Self {
            rate_per_sec,
            capacity,
            accounts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn debit(&self, reviewer_id: &str, cost: f64) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.accounts.lock().await;
        let now = Instant::now();
        let state = guard
            .entry(reviewer_id.to_string())
            .or_insert_with(|| BudgetState {
                remaining: self.capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.remaining = (state.remaining + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.remaining >= cost {
            state.remaining -= cost;
            Ok(RatePermit {
                capacity: self.capacity,
                remaining: state.remaining,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = cost - state.remaining;
            let retry_after = (deficit / self.rate_per_sec).max(0.0);
            Err(RateExceeded {
                retry_after,
                capacity: self.capacity,
                remaining: state.remaining,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BudgetState {
    remaining: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RatePermit {
    capacity: f64,
    remaining: f64,
    rate: f64,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.remaining.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.remaining) / self.rate).ceil().max(0.0) as u64;
        headers.insert(
            "X-RateLimit-Limit",
            HeaderValue::from_str(&(self.capacity as u64).to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
        headers.insert(
            "X-RateLimit-Remaining",
            HeaderValue::from_str(&remaining.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
        headers.insert(
            "X-RateLimit-Reset",
            HeaderValue::from_str(&reset.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    remaining: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(0.0) as u64;
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_str(&retry.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
        headers.insert(
            "X-RateLimit-Limit",
            HeaderValue::from_str(&(self.capacity as u64).to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        let reset = ((self.capacity - self.remaining) / self.rate).ceil().max(0.0) as u64;
        headers.insert(
            "X-RateLimit-Reset",
            HeaderValue::from_str(&reset.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(rate_per_sec: f64, capacity: f64) -> ReviewBudget {
        ReviewBudget {
            rate_per_sec,
            capacity,
            accounts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[tokio::test]
    async fn budget_exhausts_then_rejects() {
        let budget = budget(1.0, 2.0);
        assert!(budget.debit("rev-1", 1.0).await.is_ok());
        assert!(budget.debit("rev-1", 1.0).await.is_ok());
        assert!(budget.debit("rev-1", 1.0).await.is_err());
        // independent account per reviewer
        assert!(budget.debit("rev-2", 1.0).await.is_ok());
    }

    #[tokio::test]
    async fn generation_routes_drain_faster_than_reads() {
        let budget = budget(0.001, 6.0);
        // two regenerate-priced debits empty what six reads would
        assert!(budget.debit("rev-1", GENERATION_COST).await.is_ok());
        assert!(budget.debit("rev-1", GENERATION_COST).await.is_ok());
        assert!(budget.debit("rev-1", 1.0).await.is_err());

        assert_eq!(route_cost("/admin/images/abc/regenerate"), GENERATION_COST);
        assert_eq!(route_cost("/admin/orders/abc/mockups"), GENERATION_COST);
        assert_eq!(route_cost("/admin/orders/abc"), 1.0);
    }

    #[test]
    fn key_entries_carry_roles() {
        assert!(matches!(
            parse_key_entry("ana:lead:s3cret"),
            Some(("ana", ReviewerRole::Lead, "s3cret"))
        ));
        assert!(matches!(
            parse_key_entry("bob:k3y"),
            Some(("bob", ReviewerRole::Reviewer, "k3y"))
        ));
        assert!(parse_key_entry("carol:intern:k3y").is_none());
        assert!(parse_key_entry("no-key").is_none());
    }

    #[test]
    fn lead_gate_rejects_plain_reviewers() {
        let lead = AuthContext {
            reviewer_id: "ana".into(),
            api_key_id: "key-01".into(),
            role: ReviewerRole::Lead,
        };
        assert!(lead.require_lead("unlock").is_ok());

        let reviewer = AuthContext {
            reviewer_id: "bob".into(),
            api_key_id: "key-02".into(),
            role: ReviewerRole::Reviewer,
        };
        let err = reviewer.require_lead("unlock").unwrap_err();
        assert_eq!(err.stage(), "unlock");
    }

    #[test]
    fn bearer_and_custom_header_both_accepted() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sekrit"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sekrit"));

        let mut headers = http::HeaderMap::new();
        headers.insert("X-Portrait-Key", HeaderValue::from_static(" sekrit "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sekrit"));

        assert!(extract_api_key(&http::HeaderMap::new()).is_none());
    }
}
