//! Conduit edge gateway service.
//!
//! Exposes the runtime registry surface (`/runtimes/*`) and the edge task surface
//! (`/edge/tasks/*`): registration-token exchange, heartbeats, capability updates, and
//! the pull/ack/fail/result loop for authenticated runtimes. This crate is designed to
//! be embedded (tests start a `GatewayServer` on an ephemeral port) as well as run via
//! its own binary.

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use conduit_core::contracts::{
    EdgeTaskAckRequest, EdgeTaskAckResponse, EdgeTaskFailRequest, EdgeTaskFailResponse,
    EdgeTaskPullRequest, EdgeTaskPullResponse, EdgeTaskResultRequest, EdgeTaskResultResponse,
    RegistrationTokenResponse, RuntimeCapabilitiesUpdateRequest,
    RuntimeCapabilitiesUpdateResponse, RuntimeHeartbeatRequest, RuntimeHeartbeatResponse,
    RuntimeInstanceView, RuntimeRegistrationRequest, RuntimeRegistrationResponse,
};
use conduit_core::token::{RuntimePrincipal, RuntimeTokenService};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use uuid::Uuid;

pub mod config;
pub mod gateway;
pub mod lease_index;
pub mod pg;
pub mod registry;

pub use gateway::TaskGateway;
pub use registry::RuntimeRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RuntimeRegistry>,
    pub gateway: Arc<TaskGateway>,
    pub auth: Arc<RuntimeTokenService>,
    /// Static bearer secret standing in for the platform's control-plane session auth
    /// on the token-mint and instance-listing routes.
    pub control_plane_token: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/runtimes/register", post(register_runtime))
        .route("/runtimes/heartbeat", post(runtime_heartbeat))
        .route("/runtimes/capabilities", post(update_runtime_capabilities))
        .route("/runtimes/:tenant_id/tokens", post(create_registration_token))
        .route("/runtimes/:tenant_id/instances", get(list_runtime_instances))
        .route("/edge/tasks/pull", post(pull_tasks))
        .route("/edge/tasks/ack", post(ack_task))
        .route("/edge/tasks/fail", post(fail_task))
        .route("/edge/tasks/result", post(post_task_result))
        .with_state(state)
}

/// A running gateway bound to `addr`, stoppable via `shutdown`.
#[derive(Debug)]
pub struct GatewayServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl GatewayServer {
    pub async fn start(state: AppState, bind: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind gateway to {bind}"))?;
        let addr = listener.local_addr().context("gateway local_addr")?;

        let app = build_router(state);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let server = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                });
            server.await.context("serve gateway")?;
            Ok(())
        });

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join gateway task")??;
        Ok(())
    }
}

async fn register_runtime(
    State(state): State<AppState>,
    Json(request): Json<RuntimeRegistrationRequest>,
) -> ApiResult<Json<RuntimeRegistrationResponse>> {
    let response = state.registry.register_runtime(&request).await?;
    Ok(Json(response))
}

async fn runtime_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RuntimeHeartbeatRequest>,
) -> ApiResult<Json<RuntimeHeartbeatResponse>> {
    let principal = require_runtime_principal(&state.auth, &headers)?;
    let response = state
        .registry
        .heartbeat(principal.tenant_id, principal.ep_id, &request)
        .await?;
    Ok(Json(response))
}

async fn update_runtime_capabilities(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RuntimeCapabilitiesUpdateRequest>,
) -> ApiResult<Json<RuntimeCapabilitiesUpdateResponse>> {
    let principal = require_runtime_principal(&state.auth, &headers)?;
    let response = state
        .registry
        .update_capabilities(principal.tenant_id, principal.ep_id, &request)
        .await?;
    Ok(Json(response))
}

async fn create_registration_token(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<RegistrationTokenResponse>)> {
    require_control_plane(&state, &headers)?;
    let (registration_token, expires_at) = state
        .registry
        .create_registration_token(tenant_id, None)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RegistrationTokenResponse {
            registration_token,
            expires_at,
        }),
    ))
}

async fn list_runtime_instances(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<RuntimeInstanceView>>> {
    require_control_plane(&state, &headers)?;
    let instances = state.registry.list_runtimes_for_tenant(tenant_id).await?;
    Ok(Json(instances))
}

async fn pull_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EdgeTaskPullRequest>,
) -> ApiResult<Json<EdgeTaskPullResponse>> {
    let principal = require_runtime_principal(&state.auth, &headers)?;
    request.validate()?;
    let tasks = state
        .gateway
        .pull_tasks(principal.tenant_id, principal.ep_id, &request)
        .await?;
    Ok(Json(EdgeTaskPullResponse { tasks }))
}

async fn ack_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EdgeTaskAckRequest>,
) -> ApiResult<Json<EdgeTaskAckResponse>> {
    let principal = require_runtime_principal(&state.auth, &headers)?;
    let response = state
        .gateway
        .ack_task(principal.tenant_id, principal.ep_id, &request)
        .await?;
    Ok(Json(response))
}

async fn fail_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EdgeTaskFailRequest>,
) -> ApiResult<Json<EdgeTaskFailResponse>> {
    let principal = require_runtime_principal(&state.auth, &headers)?;
    request.validate()?;
    let response = state
        .gateway
        .fail_task(principal.tenant_id, principal.ep_id, &request)
        .await?;
    Ok(Json(response))
}

async fn post_task_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EdgeTaskResultRequest>,
) -> ApiResult<Json<EdgeTaskResultResponse>> {
    let principal = require_runtime_principal(&state.auth, &headers)?;
    let response = state
        .gateway
        .ingest_result(principal.tenant_id, principal.ep_id, &request)
        .await?;
    Ok(Json(response))
}

fn require_runtime_principal(
    auth: &RuntimeTokenService,
    headers: &HeaderMap,
) -> ApiResult<RuntimePrincipal> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::unauthorized("Missing runtime bearer token."))?;
    Ok(auth.verify_access_token(token)?)
}

fn require_control_plane(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let token =
        bearer_token(headers).ok_or_else(|| ApiError::unauthorized("Missing bearer token."))?;
    if token != state.control_plane_token {
        return Err(ApiError::unauthorized("Invalid control-plane token."));
    }
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl From<conduit_core::Error> for ApiError {
    fn from(err: conduit_core::Error) -> Self {
        match err {
            conduit_core::Error::Validation(message) => Self {
                status: StatusCode::BAD_REQUEST,
                message,
            },
            conduit_core::Error::Unauthorized(message) => Self {
                status: StatusCode::UNAUTHORIZED,
                message,
            },
            conduit_core::Error::Internal(inner) => {
                tracing::error!(
                    event = "conduit.gateway.internal_error",
                    error = %inner,
                    "gateway internal error"
                );
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
