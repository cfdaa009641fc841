//! HTTPS proxy and host-based router
//!
//! Every external request lands here after TLS termination. The `Host`
//! header picks the lane: the internal RPC channel, a hub-owned endpoint
//! (login, logout, refresh, poll, the debug package API), or a reverse
//! proxy hop to the instance that owns the hostname. The auth gate runs
//! before any hop: refresh-token cookie for browser traffic, access token
//! for API traffic, bearer secret for the internal channel.
//!
//! The resolved user id and access token ride to the backend in
//! `X-Manor-*` headers. Inbound copies of those headers are stripped; the
//! loopback hop is the only trusted source.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use futures::stream::{FuturesUnordered, StreamExt};
use manor_wire::{
    api::{PollBody, HEADER_ACCESS_TOKEN, HEADER_APPLICATION_ID, HEADER_USER_ID, REFRESH_COOKIE},
    LoginRequest, LoginResponse, RefreshResponse, UploadStatusResponse,
};
use tower_http::trace::TraceLayer;

use crate::audit::{AuditEvent, AuditEventKind};
use crate::error::{Error, Result};
use crate::sessions::Session;
use crate::state::{HubContext, RouteEntry};

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the hub router: one fallback service that dispatches on host and
/// path by hand, the way a proxy must.
pub fn router(ctx: Arc<HubContext>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(State(ctx): State<Arc<HubContext>>, request: Request) -> Response {
    match route(ctx, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn route(ctx: Arc<HubContext>, request: Request) -> Result<Response> {
    let host = request_host(&request)
        .ok_or_else(|| Error::InvalidRequest("request carries no host".into()))?;

    if host == ctx.config.internal_host() {
        return internal_relay(ctx, request).await;
    }

    let entry = ctx
        .routes
        .resolve_host(&host)
        .ok_or_else(|| Error::NotFound(format!("no application at '{}'", host)))?;

    let is_post = *request.method() == Method::POST;
    let is_get = *request.method() == Method::GET;
    let path = request.uri().path().to_string();
    let is_login_host = host == ctx.config.login_host();

    match path.as_str() {
        "/api/login" if is_post && is_login_host => login(ctx, request).await,
        "/api/logout" if is_post => logout(ctx, &host, request).await,
        "/api/refresh" if is_post => refresh(ctx, &host, entry, request).await,
        "/api/poll" if is_post => poll_fanout(ctx, request).await,
        "/debug/application/upload" if is_post => upload_chunk(ctx, request).await,
        "/debug/application/upload/status" if is_get => upload_status(ctx, request).await,
        "/debug/application" if is_get => fleet_status(ctx, request).await,
        "/debug/application" if is_post => set_package_active(ctx, request).await,
        _ => forward(ctx, entry, is_login_host, request).await,
    }
}

// -------------------------------------------------------------------------
// Hub-owned endpoints
// -------------------------------------------------------------------------

async fn login(ctx: Arc<HubContext>, request: Request) -> Result<Response> {
    let host = request_host(&request)
        .ok_or_else(|| Error::InvalidRequest("request carries no host".into()))?;
    let body = read_body(request).await?;
    let credentials: LoginRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("malformed login body: {}", e)))?;

    let user_id = ctx
        .dologin(&credentials.username, &credentials.password)
        .await?
        .ok_or_else(|| Error::Unauthenticated("invalid credentials".into()))?;

    let window = ctx.config.session_window_for(user_id);
    let session = ctx.sessions.create_session(user_id, window).await?;

    ctx.audit.record(
        AuditEventKind::LoginSuccess,
        AuditEvent::new(format!("login as {}", credentials.username))
            .user(user_id)
            .refresh_fingerprint(session.fingerprint.clone()),
    );

    let response = Json(LoginResponse {
        domain: ctx.config.domain.clone(),
        app_refresh_token: session.refresh_token.clone(),
    });
    Ok((
        [(
            header::SET_COOKIE,
            refresh_cookie(&host, &session.refresh_token),
        )],
        response,
    )
        .into_response())
}

async fn logout(ctx: Arc<HubContext>, host: &str, request: Request) -> Result<Response> {
    if let Some(token) = refresh_token_from(request.headers()) {
        if let Some(session) = ctx.sessions.get_by_refresh_token(&token).await? {
            ctx.sessions
                .delete_sessions_for_user(session.user_id)
                .await?;
            ctx.audit.record(
                AuditEventKind::Logout,
                AuditEvent::new("logout")
                    .user(session.user_id)
                    .refresh_fingerprint(session.fingerprint),
            );
        }
    }

    Ok((
        [(header::SET_COOKIE, clear_refresh_cookie(host))],
        Json(serde_json::json!({"status": "ok"})),
    )
        .into_response())
}

async fn refresh(
    ctx: Arc<HubContext>,
    host: &str,
    entry: RouteEntry,
    request: Request,
) -> Result<Response> {
    let token = refresh_token_from(request.headers())
        .ok_or_else(|| Error::Forbidden("no refresh token".into()))?;

    let Some(session) = ctx.sessions.get_by_refresh_token(&token).await? else {
        ctx.audit.record(
            AuditEventKind::InvalidRefreshToken,
            AuditEvent::new(format!("unknown refresh token presented at {}", host))
                .refresh_fingerprint(ctx.sessions.fingerprint_of(&token)),
        );
        return Err(Error::Forbidden("invalid refresh token".into()));
    };

    if session.is_expired(chrono::Utc::now()) {
        ctx.audit.record(
            AuditEventKind::SessionExpired,
            AuditEvent::new("refresh on expired session")
                .user(session.user_id)
                .refresh_fingerprint(session.fingerprint.clone()),
        );
        return Err(Error::Unauthenticated("session expired".into()));
    }

    if !ctx
        .check_access(session.user_id, &entry.instance_id)
        .await?
    {
        return Err(Error::Forbidden("access denied".into()));
    }

    let (access, rotated) = ctx
        .sessions
        .mint_access_token(
            &session,
            ctx.config.access_window(),
            ctx.config.rotation_grace(),
            ctx.config.session_window_for(session.user_id),
            &entry.instance_id,
        )
        .await?;

    ctx.audit.record(
        AuditEventKind::TokenRefresh,
        AuditEvent::new(format!("token rotation at {}", host))
            .user(session.user_id)
            .refresh_fingerprint(format!(
                "{} -> {}",
                session.fingerprint, rotated.fingerprint
            ))
            .access_fingerprint(ctx.sessions.fingerprint_of(&access.token)),
    );

    Ok((
        [(
            header::SET_COOKIE,
            refresh_cookie(host, &rotated.refresh_token),
        )],
        Json(RefreshResponse {
            access_token: access.token,
        }),
    )
        .into_response())
}

/// Fan the multi-instance poll body out to every named instance; the
/// instances hold the actual long-poll wait. First advancement wins.
async fn poll_fanout(ctx: Arc<HubContext>, request: Request) -> Result<Response> {
    let body = read_body(request).await?;
    let wanted: PollBody = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("malformed poll body: {}", e)))?;
    if wanted.is_empty() {
        return Err(Error::InvalidRequest("poll body names no instances".into()));
    }

    let mut waits = FuturesUnordered::new();
    for (instance_id, since) in wanted {
        let Some(entry) = ctx.routes.resolve_instance(&instance_id) else {
            continue;
        };
        let http = ctx.http.clone();
        let deadline = ctx.config.poll_timeout() + Duration::from_secs(5);
        waits.push(async move {
            let mut body = PollBody::new();
            body.insert(instance_id, since);
            let response = http
                .post(format!("{}/api/poll", entry.local_addr))
                .timeout(deadline)
                .json(&body)
                .send()
                .await
                .ok()?;
            if response.status() != StatusCode::OK {
                return None;
            }
            response.json::<PollBody>().await.ok()
        });
    }
    if waits.is_empty() {
        return Err(Error::NotFound("no named instance is running".into()));
    }

    let advanced = tokio::time::timeout(ctx.config.poll_timeout(), async {
        while let Some(result) = waits.next().await {
            if let Some(map) = result {
                if !map.is_empty() {
                    return Some(map);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    match advanced {
        Some(map) => Ok(Json(map).into_response()),
        None => Ok(StatusCode::NOT_MODIFIED.into_response()),
    }
}

// -------------------------------------------------------------------------
// Debug package API (administrator only)
// -------------------------------------------------------------------------

async fn require_admin_session(ctx: &HubContext, headers: &HeaderMap) -> Result<Session> {
    let token = refresh_token_from(headers)
        .ok_or_else(|| Error::Unauthenticated("authentication required".into()))?;
    let session = ctx
        .sessions
        .get_by_refresh_token(&token)
        .await?
        .ok_or_else(|| Error::Unauthenticated("invalid refresh token".into()))?;
    if session.is_expired(chrono::Utc::now()) {
        return Err(Error::Unauthenticated("session expired".into()));
    }
    if session.user_id != 1 {
        return Err(Error::Forbidden("administrator only".into()));
    }
    Ok(session)
}

async fn upload_chunk(ctx: Arc<HubContext>, request: Request) -> Result<Response> {
    require_admin_session(&ctx, request.headers()).await?;

    let mut multipart = Multipart::from_request(request, &ctx)
        .await
        .map_err(|e| Error::InvalidRequest(format!("malformed multipart body: {}", e)))?;

    let mut instance_id = None;
    let mut chunk_index = None;
    let mut total_chunks = None;
    let mut file_hash = None;
    let mut chunk = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(format!("unreadable multipart field: {}", e)))?
    {
        match field.name().unwrap_or_default() {
            "instanceId" => {
                instance_id = Some(field.text().await.map_err(bad_field)?);
            }
            "chunkIndex" => {
                chunk_index = Some(parse_field(&field.text().await.map_err(bad_field)?)?);
            }
            "totalChunks" => {
                total_chunks = Some(parse_field(&field.text().await.map_err(bad_field)?)?);
            }
            "fileHash" => {
                file_hash = Some(field.text().await.map_err(bad_field)?);
            }
            "chunk" => {
                chunk = Some(field.bytes().await.map_err(bad_field)?);
            }
            other => {
                tracing::debug!("ignoring unknown upload field '{}'", other);
            }
        }
    }

    let instance_id =
        instance_id.ok_or_else(|| Error::InvalidRequest("instanceId is required".into()))?;
    let chunk_index =
        chunk_index.ok_or_else(|| Error::InvalidRequest("chunkIndex is required".into()))?;
    let total_chunks =
        total_chunks.ok_or_else(|| Error::InvalidRequest("totalChunks is required".into()))?;
    let file_hash = file_hash.ok_or_else(|| Error::InvalidRequest("fileHash is required".into()))?;
    let chunk = chunk.ok_or_else(|| Error::InvalidRequest("chunk is required".into()))?;

    let status = ctx
        .packages
        .handle_chunk(&instance_id, chunk_index, total_chunks, &file_hash, &chunk)
        .await?;
    Ok(Json(status).into_response())
}

fn bad_field(e: axum::extract::multipart::MultipartError) -> Error {
    Error::InvalidRequest(format!("unreadable multipart field: {}", e))
}

fn parse_field(text: &str) -> Result<u32> {
    text.parse()
        .map_err(|_| Error::InvalidRequest(format!("'{}' is not a chunk number", text)))
}

async fn upload_status(ctx: Arc<HubContext>, request: Request) -> Result<Response> {
    require_admin_session(&ctx, request.headers()).await?;
    let instance_id = query_param(request.uri(), "instanceId")
        .ok_or_else(|| Error::InvalidRequest("instanceId query parameter is required".into()))?;

    match ctx.packages.upload_status(&instance_id).await {
        Some(status) => Ok(Json(status).into_response()),
        None => Ok(Json(UploadStatusResponse {
            total_chunks: 0,
            received_chunks: 0,
            progress: 0.0,
            completed: false,
        })
        .into_response()),
    }
}

async fn fleet_status(ctx: Arc<HubContext>, request: Request) -> Result<Response> {
    require_admin_session(&ctx, request.headers()).await?;

    let mut fleet = Vec::new();
    for entry in ctx.runtime.iter() {
        let instance_id = entry.key().clone();
        let runtime = entry.value().clone();
        fleet.push(serde_json::json!({
            "instance_id": instance_id,
            "host_name": ctx
                .routes
                .resolve_instance(&instance_id)
                .map(|e| e.host_name),
            "healthy": runtime.healthy,
            "restarts": runtime.restarts,
            "consecutive_failures": runtime.consecutive_failures,
            "package_active": ctx.packages.is_active(&instance_id),
        }));
    }
    fleet.sort_by(|a, b| {
        a["instance_id"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["instance_id"].as_str().unwrap_or_default())
    });
    Ok(Json(fleet).into_response())
}

#[derive(serde::Deserialize)]
struct SetActiveBody {
    instance_id: String,
    active: bool,
}

async fn set_package_active(ctx: Arc<HubContext>, request: Request) -> Result<Response> {
    require_admin_session(&ctx, request.headers()).await?;
    let body = read_body(request).await?;
    let body: SetActiveBody = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("malformed body: {}", e)))?;

    ctx.packages.set_active(&body.instance_id, body.active).await?;
    tracing::info!(
        "package for {} marked {}",
        body.instance_id,
        if body.active { "active" } else { "inactive" }
    );
    Ok(Json(serde_json::json!({"status": "ok"})).into_response())
}

// -------------------------------------------------------------------------
// Internal RPC channel
// -------------------------------------------------------------------------

async fn internal_relay(ctx: Arc<HubContext>, request: Request) -> Result<Response> {
    let presented = bearer_token(request.headers())
        .ok_or_else(|| Error::Unauthenticated("missing internal bearer token".into()))?;
    if blake3::hash(presented.as_bytes())
        != blake3::hash(ctx.config.internal_secret.as_bytes())
    {
        return Err(Error::Unauthenticated("invalid internal bearer token".into()));
    }

    let application_id = request
        .headers()
        .get(HEADER_APPLICATION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::InvalidRequest(format!("{} header is required", HEADER_APPLICATION_ID))
        })?;

    let entry = ctx
        .routes
        .resolve_instance(&application_id)
        .ok_or_else(|| Error::NotFound(format!("no instance '{}'", application_id)))?;

    // Forward verbatim, re-stamping the secret for the loopback hop.
    let stamped = vec![(
        header::AUTHORIZATION,
        format!("Bearer {}", ctx.config.internal_secret),
    )];
    proxy_pass(ctx, entry, request, stamped).await
}

// -------------------------------------------------------------------------
// Authenticated forwarding
// -------------------------------------------------------------------------

async fn forward(
    ctx: Arc<HubContext>,
    entry: RouteEntry,
    is_login_host: bool,
    request: Request,
) -> Result<Response> {
    let path = request.uri().path().to_string();

    // Liveness is public, and everything on the login host is.
    if path == "/api/status" || is_login_host {
        return proxy_pass(ctx, entry, request, Vec::new()).await;
    }

    if path.starts_with("/api/") {
        let (user_id, access_token) = authenticate_api(&ctx, &entry, request.headers()).await?;
        let extra = vec![
            (HeaderName::from_static(HEADER_USER_ID), user_id.to_string()),
            (
                HeaderName::from_static(HEADER_ACCESS_TOKEN),
                access_token.unwrap_or_default(),
            ),
        ];
        return proxy_pass(ctx, entry, request, extra).await;
    }

    // Browser-facing paths: a valid session or a trip to the login page.
    match session_from_cookie(&ctx, request.headers()).await? {
        Some(session) => {
            let extra = vec![(
                HeaderName::from_static(HEADER_USER_ID),
                session.user_id.to_string(),
            )];
            proxy_pass(ctx, entry, request, extra).await
        }
        None => {
            let host = request_host(&request).unwrap_or_default();
            let location = format!(
                "https://{}/?redirect=https://{}{}",
                ctx.config.login_host(),
                host,
                path
            );
            Ok((
                StatusCode::FOUND,
                [(header::LOCATION, location)],
            )
                .into_response())
        }
    }
}

/// API authentication: an access token bound to this application, or a
/// valid session cookie plus a fresh access check.
async fn authenticate_api(
    ctx: &HubContext,
    entry: &RouteEntry,
    headers: &HeaderMap,
) -> Result<(i64, Option<String>)> {
    if let Some(token) = bearer_token(headers) {
        let access = ctx
            .sessions
            .lookup_access_token(&token)
            .ok_or_else(|| Error::Unauthenticated("invalid or expired access token".into()))?;
        if access.application_id != entry.instance_id {
            return Err(Error::Forbidden(
                "access token was minted for another application".into(),
            ));
        }
        return Ok((access.user_id, Some(token)));
    }

    let session = session_from_cookie(ctx, headers)
        .await?
        .ok_or_else(|| Error::Unauthenticated("authentication required".into()))?;
    if !ctx.check_access(session.user_id, &entry.instance_id).await? {
        return Err(Error::Forbidden("access denied".into()));
    }
    Ok((session.user_id, None))
}

/// Resolve the refresh cookie to a live session, if any.
async fn session_from_cookie(ctx: &HubContext, headers: &HeaderMap) -> Result<Option<Session>> {
    let Some(token) = refresh_token_from(headers) else {
        return Ok(None);
    };
    let Some(session) = ctx.sessions.get_by_refresh_token(&token).await? else {
        ctx.audit.record(
            AuditEventKind::InvalidRefreshToken,
            AuditEvent::new("unknown refresh token in cookie")
                .refresh_fingerprint(ctx.sessions.fingerprint_of(&token)),
        );
        return Ok(None);
    };
    if session.is_expired(chrono::Utc::now()) {
        return Ok(None);
    }
    Ok(Some(session))
}

/// The actual reverse-proxy hop.
async fn proxy_pass(
    ctx: Arc<HubContext>,
    entry: RouteEntry,
    request: Request,
    extra_headers: Vec<(HeaderName, String)>,
) -> Result<Response> {
    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("{}{}", entry.local_addr, path_and_query);

    let mut headers = HeaderMap::new();
    for (name, value) in request.headers() {
        if is_forwardable(name) {
            headers.insert(name.clone(), value.clone());
        }
    }
    for (name, value) in extra_headers {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| Error::Internal(format!("unencodable header value: {}", e)))?;
        headers.insert(name, value);
    }

    let body = read_body(request).await?;
    let upstream = ctx
        .http
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            // A dead backend earns an immediate probe.
            ctx.nudge_probe(&entry.instance_id);
            Error::Unavailable(format!(
                "instance {} unreachable: {}",
                entry.instance_id, e
            ))
        })?;

    let status = upstream.status();
    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if is_forwardable(name) {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}

// -------------------------------------------------------------------------
// Small helpers
// -------------------------------------------------------------------------

/// Host of the request without any port, lowercased.
fn request_host(request: &Request) -> Option<String> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.as_str().to_string()))?;
    Some(strip_port(&raw).to_lowercase())
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':')
        .map(|(name, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                name
            } else {
                host
            }
        })
        .unwrap_or(host)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Value of the refresh cookie, if present.
fn refresh_token_from(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let (name, value) = pair.trim().split_once('=')?;
        if name == REFRESH_COOKIE {
            return Some(value.to_string());
        }
    }
    None
}

fn refresh_cookie(host: &str, token: &str) -> String {
    format!(
        "{}={}; Path=/; Domain={}; HttpOnly; Secure; SameSite=None",
        REFRESH_COOKIE, token, host
    )
}

fn clear_refresh_cookie(host: &str) -> String {
    format!(
        "{}=; Path=/; Domain={}; HttpOnly; Secure; SameSite=None; Max-Age=0",
        REFRESH_COOKIE, host
    )
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn is_forwardable(name: &HeaderName) -> bool {
    // Hop-by-hop headers, the host, and anything the hub itself stamps.
    !matches!(
        name.as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    ) && !name.as_str().starts_with("x-manor-")
}

async fn read_body(request: Request) -> Result<axum::body::Bytes> {
    axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::InvalidRequest(format!("unreadable request body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_handles_hosts_and_ports() {
        assert_eq!(strip_port("app.example.test:8443"), "app.example.test");
        assert_eq!(strip_port("app.example.test"), "app.example.test");
        assert_eq!(strip_port("localhost:80"), "localhost");
    }

    #[test]
    fn refresh_token_is_found_among_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; YRT=tok-123; lang=en"),
        );
        assert_eq!(refresh_token_from(&headers), Some("tok-123".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark"));
        assert_eq!(refresh_token_from(&headers), None);
    }

    #[test]
    fn cookie_attributes_match_the_contract() {
        let cookie = refresh_cookie("app.example.test", "tok");
        assert!(cookie.starts_with("YRT=tok; "));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Domain=app.example.test"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=None"));

        let cleared = clear_refresh_cookie("app.example.test");
        assert!(cleared.contains("Max-Age=0"));
    }

    #[test]
    fn bearer_tokens_require_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        assert_eq!(bearer_token(&headers), Some("abc".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn hub_headers_are_never_forwarded_inbound() {
        assert!(!is_forwardable(&HeaderName::from_static(
            "x-manor-user-id"
        )));
        assert!(!is_forwardable(&HeaderName::from_static("host")));
        assert!(!is_forwardable(&HeaderName::from_static(
            "transfer-encoding"
        )));
        assert!(is_forwardable(&HeaderName::from_static("content-type")));
        assert!(is_forwardable(&HeaderName::from_static("accept")));
    }

    #[test]
    fn query_params_parse_plainly() {
        let uri: Uri = "https://h/debug/application/upload/status?instanceId=notes&x=1"
            .parse()
            .unwrap();
        assert_eq!(query_param(&uri, "instanceId"), Some("notes".to_string()));
        assert_eq!(query_param(&uri, "missing"), None);
    }
}
