//! Instance HTTP API
//!
//! Served on a loopback port and reached only through the hub. The fixed
//! surface is the event API plus the internal RPCs; anything else falls
//! through to the guest module's registered request handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use manor_wire::{
    api::{HEADER_ACCESS_TOKEN, HEADER_USER_ID},
    CheckAccessRequest, CheckAccessResponse, DoLoginRequest, DoLoginResponse, GuestHttpRequest,
    ListInstancesResponse, PublishResponse, StatusResponse,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::{AppKind, InstanceConfig};
use crate::dbproxy::DbProxy;
use crate::error::{Error, Result};
use crate::events::EventStore;
use crate::sandbox::SandboxHost;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<InstanceConfig>,
    pub store: Arc<EventStore>,
    pub db: Arc<DbProxy>,
    pub sandbox: Option<Arc<SandboxHost>>,
    pub shutdown: CancellationToken,
}

/// Build the instance router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/publish", post(publish))
        .route("/api/poll", post(poll))
        .route("/api/event/{id}", get(get_event))
        .route("/internal/dologin", post(dologin_rpc))
        .route("/internal/checkAccess", post(check_access_rpc))
        .route("/internal/listInstances", post(list_instances_rpc))
        .route("/internal/shutdown", post(shutdown_rpc))
        .fallback(guest_dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind the loopback listener and serve until shutdown.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], state.config.port));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        "instance {} listening on {}",
        state.config.instance_id,
        addr
    );

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("instance shutdown complete");
    Ok(())
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse::ok(state.store.status()))
}

#[derive(Deserialize)]
struct PublishParams {
    cid: Option<String>,
}

async fn publish(
    State(state): State<AppState>,
    Query(params): Query<PublishParams>,
    Json(payload): Json<JsonValue>,
) -> Result<Json<PublishResponse>> {
    let client_id = params
        .cid
        .ok_or_else(|| Error::InvalidRequest("cid query parameter is required".into()))?;
    let (status, id) = state.store.publish(&client_id, payload).await?;
    Ok(Json(PublishResponse {
        status,
        id,
        client_id,
    }))
}

async fn poll(
    State(state): State<AppState>,
    Json(body): Json<manor_wire::api::PollBody>,
) -> Result<Response> {
    let instance_id = &state.config.instance_id;
    let requested = *body.get(instance_id).ok_or_else(|| {
        Error::InvalidRequest(format!("poll body names no entry for '{}'", instance_id))
    })?;

    match state.store.poll(requested).await {
        Some(current) => {
            let mut advanced = manor_wire::api::PollBody::new();
            advanced.insert(instance_id.clone(), current);
            Ok(Json(advanced).into_response())
        }
        None => Ok(StatusCode::NOT_MODIFIED.into_response()),
    }
}

async fn get_event(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Response> {
    let (_, payload) = state.store.get(id).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response())
}

/// Constant-time bearer check for the internal channel. An unset secret
/// fails closed.
fn authorize_internal(config: &InstanceConfig, headers: &HeaderMap) -> Result<()> {
    if config.internal_secret.is_empty() {
        return Err(Error::Unauthenticated(
            "internal channel is not configured".into(),
        ));
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::Unauthenticated("missing internal bearer token".into()))?;

    if blake3::hash(presented.as_bytes()) != blake3::hash(config.internal_secret.as_bytes()) {
        return Err(Error::Unauthenticated("invalid internal bearer token".into()));
    }
    Ok(())
}

fn require_admin_app(config: &InstanceConfig) -> Result<()> {
    if config.app != AppKind::Admin {
        return Err(Error::NotFound(
            "this instance does not serve identity RPCs".into(),
        ));
    }
    Ok(())
}

async fn dologin_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DoLoginRequest>,
) -> Result<Json<DoLoginResponse>> {
    authorize_internal(&state.config, &headers)?;
    require_admin_app(&state.config)?;

    let user_id = crate::admin::dologin(state.db.connection(), &body.username, &body.password)
        .await?;
    Ok(Json(DoLoginResponse {
        success: user_id.is_some(),
        user_id: user_id.unwrap_or(0),
    }))
}

async fn check_access_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckAccessRequest>,
) -> Result<Json<CheckAccessResponse>> {
    authorize_internal(&state.config, &headers)?;
    require_admin_app(&state.config)?;

    let access_granted =
        crate::admin::check_access(state.db.connection(), body.user_id, &body.application_id)
            .await?;
    Ok(Json(CheckAccessResponse { access_granted }))
}

async fn list_instances_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListInstancesResponse>> {
    authorize_internal(&state.config, &headers)?;
    require_admin_app(&state.config)?;

    let instances = crate::admin::list_instances(state.db.connection()).await?;
    Ok(Json(ListInstancesResponse { instances }))
}

async fn shutdown_rpc(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize_internal(&state.config, &headers)?;
    tracing::info!("shutdown requested over the internal channel");
    state.shutdown.cancel();
    Ok(Json(serde_json::json!({"status": "shutting down"})).into_response())
}

/// Everything outside the fixed surface goes to the guest module.
async fn guest_dispatch(State(state): State<AppState>, request: Request) -> Result<Response> {
    let Some(sandbox) = state.sandbox.clone() else {
        return Err(Error::NotFound("no such endpoint".into()));
    };

    let path = request.uri().path().to_string();
    let Some(handler_id) = sandbox.handler_for(&path) else {
        return Err(Error::NotFound(format!("no handler for {}", path)));
    };

    let method = request.method().as_str().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let mut headers = Vec::new();
    for name in [
        header::CONTENT_TYPE.as_str(),
        HEADER_USER_ID,
        HEADER_ACCESS_TOKEN,
    ] {
        if let Some(value) = request.headers().get(name).and_then(|v| v.to_str().ok()) {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::InvalidRequest(format!("unreadable request body: {}", e)))?;

    let guest_request = GuestHttpRequest {
        method,
        path,
        query,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    };

    let guest_response = sandbox.handle_request(handler_id, &guest_request).await?;

    let mut builder = Response::builder().status(
        StatusCode::from_u16(guest_response.status)
            .map_err(|_| Error::Guest(format!("guest returned status {}", guest_response.status)))?,
    );
    for (name, value) in &guest_response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(axum::body::Body::from(guest_response.body))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}
