//! HTTP surface for slot holds.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use ulid::Ulid;

use crate::identity::CallerId;
use crate::lease::{LeaseError, LeaseManager, ReleaseOutcome};
use crate::limits::*;
use crate::model::{Ms, Slot};
use crate::store::{SlotStore, StoreError};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub leases: Arc<LeaseManager>,
    /// Direct store access for slot creation only; holds go through `leases`.
    pub store: Arc<dyn SlotStore>,
    pub identity_header: HeaderName,
    pub expose_errors: bool,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/slots", post(create_slot))
        .route("/slots/{id}", get(get_slot))
        .route("/slots/{id}/hold", post(acquire_hold).delete(release_hold))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response: `{"error": "..."}` with a mapped status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(e: &StoreError, expose: bool) -> Self {
        let message = if expose {
            e.to_string()
        } else {
            "internal error".to_string()
        };
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn from_lease(e: LeaseError, expose: bool) -> Self {
        let status = match &e {
            LeaseError::Auth(_) => StatusCode::UNAUTHORIZED,
            LeaseError::Validation(_) => StatusCode::BAD_REQUEST,
            LeaseError::Conflict(_) => StatusCode::CONFLICT,
            LeaseError::Store(store) => return Self::internal(store, expose),
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn caller<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "version": env!("CARGO_PKG_VERSION") }))
}

/// Place a hold. 200 with the held slot, including `holdExpiresAt`.
async fn acquire_hold(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Slot>, ApiError> {
    let caller = caller(&headers, &state.identity_header);
    let lease = state
        .leases
        .acquire(caller, &id)
        .await
        .map_err(|e| ApiError::from_lease(e, state.expose_errors))?;
    Ok(Json(lease.slot))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseBody {
    slot_id: String,
    released: bool,
}

async fn release_hold(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ReleaseBody>, ApiError> {
    let caller = caller(&headers, &state.identity_header);
    let outcome = state
        .leases
        .release(caller, &id)
        .await
        .map_err(|e| ApiError::from_lease(e, state.expose_errors))?;
    let (slot_id, released) = match outcome {
        ReleaseOutcome::Released(slot) => (slot.id.to_string(), true),
        ReleaseOutcome::NotHeld => (id.trim().to_string(), false),
    };
    Ok(Json(ReleaseBody { slot_id, released }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SlotBody {
    #[serde(flatten)]
    slot: Slot,
    hold_active: bool,
}

async fn get_slot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SlotBody>, ApiError> {
    let caller = caller(&headers, &state.identity_header);
    let view = state
        .leases
        .inspect(caller, &id)
        .await
        .map_err(|e| ApiError::from_lease(e, state.expose_errors))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "slot not found"))?;
    Ok(Json(SlotBody {
        slot: view.slot,
        hold_active: view.hold_active,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSlotRequest {
    /// Client-chosen id; generated when absent.
    #[serde(default)]
    id: Option<Ulid>,
    starts_at: Ms,
    ends_at: Ms,
    price: i64,
}

impl CreateSlotRequest {
    fn validate(&self) -> Result<(), &'static str> {
        if self.starts_at >= self.ends_at {
            return Err("startsAt must be before endsAt");
        }
        if self.starts_at < MIN_VALID_TIMESTAMP_MS || self.ends_at > MAX_VALID_TIMESTAMP_MS {
            return Err("timestamp out of range");
        }
        if self.ends_at - self.starts_at > MAX_SLOT_DURATION_MS {
            return Err("slot too long");
        }
        if self.price < 0 {
            return Err("price must not be negative");
        }
        Ok(())
    }
}

/// Publish a new open slot owned by the caller.
async fn create_slot(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateSlotRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Slot>), ApiError> {
    let owner = CallerId::parse(caller(&headers, &state.identity_header))
        .map_err(|e| ApiError::from_lease(e, state.expose_errors))?;
    let Json(request) = payload.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
    request
        .validate()
        .map_err(|msg| ApiError::new(StatusCode::BAD_REQUEST, msg))?;

    let slot = Slot::open(
        request.id.unwrap_or_else(Ulid::new),
        owner.as_str(),
        request.starts_at,
        request.ends_at,
        request.price,
    );
    match state.store.insert_slot(slot.clone()).await {
        Ok(()) => {
            info!(slot_id = %slot.id, owner = %owner, "slot created");
            Ok((StatusCode::CREATED, Json(slot)))
        }
        Err(StoreError::AlreadyExists(_)) => Err(ApiError::new(StatusCode::CONFLICT, "slot already exists")),
        Err(StoreError::InvalidSlot { reason, .. }) => Err(ApiError::new(StatusCode::BAD_REQUEST, reason)),
        Err(e) => {
            error!(slot_id = %slot.id, "slot insert failed: {e}");
            Err(ApiError::internal(&e, state.expose_errors))
        }
    }
}
