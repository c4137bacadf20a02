//! HTTP surface of a swarm member.
//!
//! `/Swarm/*` carries member-to-member traffic and requires both the shared
//! secret and a registration token, except where a token cannot exist yet:
//! registering, and downloading a package from a member that did not issue
//! the caller's token.  `/Administration/*` is the operator's entry point and
//! only requires the secret.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use log::{debug, error};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SwarmError;
use crate::service::{SwarmService, UpdateOutcome, UpdateStatus};
use crate::types::{
    AbortQuery, RegistrationRequest, RegistrationResponse, Route, ServersUpdateRequest, SwarmMember,
    TransferQuery, UpdateRequest, API_KEY_HEADER, PACKAGE_DIGEST_HEADER, REGISTRATION_HEADER,
};

const ADMINISTRATION_PREFIX: &str = "/Administration/";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SwarmService>,
}

/// Registration token of an authenticated `/Swarm` request.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationToken(pub Uuid);

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(Route::Root.path(), get(ping).post(servers_updated))
        .route(
            Route::Register.path(),
            post(register).delete(unregister),
        )
        .route(
            Route::Update.path(),
            post(update_signal).put(prepare_update).delete(abort_update),
        )
        .route(Route::Transfer.path(), get(transfer))
        // Operator
        .route(
            "/Administration/Update/{version}",
            post(administer_update).layer(DefaultBodyLimit::disable()),
        )
        .route("/Administration/Status", get(status))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state)
}

/// Serves `router` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

fn registration_token(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(REGISTRATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}

fn exempt_from_registration(method: &Method, path: &str) -> bool {
    (*method == Method::POST && path == Route::Register.path())
        || (*method == Method::GET && path == Route::Transfer.path())
        || path.starts_with(ADMINISTRATION_PREFIX)
}

async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if api_key != Some(state.service.private_key()) {
        debug!("Rejected {} {}: bad API key", request.method(), request.uri().path());
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if exempt_from_registration(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let token = registration_token(request.headers());
    let valid = match token {
        Some(token) => state.service.validate_registration(token).await,
        None => false,
    };
    match token {
        Some(token) if valid => {
            request.extensions_mut().insert(RegistrationToken(token));
            next.run(request).await
        }
        _ => {
            debug!(
                "Rejected {} {}: unknown registration",
                request.method(),
                request.uri().path()
            );
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

impl IntoResponse for SwarmError {
    fn into_response(self) -> Response {
        let status = match &self {
            SwarmError::Conflict(_)
            | SwarmError::InsufficientNodes { .. }
            | SwarmError::MembershipPending => StatusCode::CONFLICT,
            SwarmError::Unauthorized | SwarmError::NotRegistered => StatusCode::UNAUTHORIZED,
            SwarmError::VersionMismatch { .. } => StatusCode::UPGRADE_REQUIRED,
            SwarmError::Payload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request refused ({}): {}", status, self);
        }
        (status, self.to_string()).into_response()
    }
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

/// Membership push from the controller.
async fn servers_updated(
    State(state): State<AppState>,
    Json(request): Json<ServersUpdateRequest>,
) -> Result<StatusCode, SwarmError> {
    state.service.replace_local_view(request.swarm_servers).await?;
    Ok(StatusCode::OK)
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegistrationRequest>,
) -> Result<Json<RegistrationResponse>, SwarmError> {
    let token = registration_token(&headers)
        .ok_or_else(|| SwarmError::Payload(format!("missing {} header", REGISTRATION_HEADER)))?;
    let response = state.service.accept_registration(token, request).await?;
    Ok(Json(response))
}

async fn unregister(
    State(state): State<AppState>,
    Extension(RegistrationToken(token)): Extension<RegistrationToken>,
) -> Result<StatusCode, SwarmError> {
    state.service.unregistration_received(token).await?;
    Ok(StatusCode::OK)
}

async fn prepare_update(
    State(state): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> Result<StatusCode, SwarmError> {
    state.service.prepare_update_from_peer(request).await?;
    Ok(StatusCode::OK)
}

/// Ready signal on the controller, commit on a node.
async fn update_signal(
    State(state): State<AppState>,
    Extension(RegistrationToken(token)): Extension<RegistrationToken>,
) -> Result<StatusCode, SwarmError> {
    state.service.update_signal_received(token).await?;
    Ok(StatusCode::OK)
}

async fn abort_update(
    State(state): State<AppState>,
    Query(query): Query<AbortQuery>,
) -> StatusCode {
    state.service.abort_received(query.version.as_deref()).await;
    StatusCode::OK
}

async fn transfer(State(state): State<AppState>, Query(query): Query<TransferQuery>) -> Response {
    match state.service.tickets().redeem(&query.ticket).await {
        Some(package) => ([(PACKAGE_DIGEST_HEADER, package.sha256)], package.bytes).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown download ticket").into_response(),
    }
}

async fn administer_update(
    State(state): State<AppState>,
    Path(version): Path<String>,
    package: Bytes,
) -> (StatusCode, Json<UpdateOutcome>) {
    let outcome = state.service.request_update(&version, package).await;
    let status = if outcome.is_committed() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(outcome))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    identifier: String,
    controller: bool,
    registered: bool,
    members: Vec<SwarmMember>,
    update: UpdateStatus,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let service = &state.service;
    Json(StatusResponse {
        identifier: service.identity().identifier.clone(),
        controller: service.is_controller(),
        registered: service.is_registered().await,
        members: service.members().await,
        update: service.update_status().await,
    })
}
