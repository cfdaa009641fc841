//! Sandbox host for guest modules
//!
//! One wasmtime instance per application, owned by a dedicated worker
//! thread. The guest registers its request and event handlers while its
//! start function runs; afterwards every call into the guest travels
//! through the worker's job queue, which is what serializes guest execution
//! (single mutator). Async callers await a oneshot reply and never touch
//! the store directly.

pub mod alloc;
mod imports;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use manor_wire::{CrossServiceRequest, CrossServiceResponse, GuestHttpRequest, GuestHttpResponse};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use wasmtime::{Engine, Instance, Linker, Memory, Module, Store, TypedFunc};

use crate::config::InstanceConfig;
use crate::dbproxy::DbProxy;
use crate::error::{Error, Result};
use crate::events::EventHandler;
use alloc::PagePool;

/// ABI revision the host speaks; guests announce theirs via `init_module`.
pub const ABI_VERSION: i32 = 1;

/// Per-store state visible to host imports.
pub(crate) struct HostState {
    pub instance_id: String,
    pub env: HashMap<String, String>,
    pub alloc: PagePool,
    pub routes: HashMap<String, i32>,
    pub event_handlers: Vec<(String, i32)>,
    pub response: Option<Vec<u8>>,
    pub event_error: Option<String>,
    pub abi_version: Option<i32>,
    pub db: Arc<DbProxy>,
    pub cross: Arc<CrossServiceClient>,
    pub rt: tokio::runtime::Handle,
}

/// Relays guest-originated calls to other instances through the hub's
/// internal host. Failures come back as structured responses, never traps.
pub struct CrossServiceClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl CrossServiceClient {
    pub fn new(config: &InstanceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.cross_service_timeout_secs))
            .danger_accept_invalid_certs(config.relax_internal_tls)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build internal HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.internal_base_url.trim_end_matches('/').to_string(),
            secret: config.internal_secret.clone(),
        })
    }

    /// Handle one raw request envelope from the guest.
    pub async fn call_raw(&self, request: &[u8]) -> Vec<u8> {
        let response = match self.call(request).await {
            Ok(response) => response,
            Err(message) => {
                tracing::warn!("cross-service call failed: {}", message);
                CrossServiceResponse {
                    status: 500,
                    body: message,
                }
            }
        };
        serde_json::to_vec(&response)
            .unwrap_or_else(|_| b"{\"status\":500,\"body\":\"\"}".to_vec())
    }

    async fn call(&self, request: &[u8]) -> std::result::Result<CrossServiceResponse, String> {
        let request: CrossServiceRequest = serde_json::from_slice(request)
            .map_err(|e| format!("malformed cross-service request: {}", e))?;
        if self.base_url.is_empty() {
            return Err("internal host is not configured".to_string());
        }
        let method = http::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| format!("invalid method '{}': {}", request.method, e))?;
        let url = format!("{}{}", self.base_url, request.path);

        let response = self
            .http
            .request(method, url)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", self.secret),
            )
            .header(
                manor_wire::api::HEADER_APPLICATION_ID,
                request.application_id.as_str(),
            )
            .body(request.body)
            .send()
            .await
            .map_err(|e| format!("cross-service call failed: {}", e))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(CrossServiceResponse { status, body })
    }
}

enum Job {
    Request {
        body: Vec<u8>,
        handler_id: i32,
        reply: oneshot::Sender<Result<GuestHttpResponse>>,
    },
    Event {
        payload: Vec<u8>,
        tx_id: u64,
        handler_id: i32,
        reply: oneshot::Sender<Result<bool>>,
    },
}

struct BootInfo {
    routes: HashMap<String, i32>,
    event_handlers: Vec<(String, i32)>,
}

/// Handle to a running guest module.
pub struct SandboxHost {
    jobs: mpsc::UnboundedSender<Job>,
    routes: HashMap<String, i32>,
    event_handlers: Vec<(String, i32)>,
}

impl SandboxHost {
    /// Load the guest module and wait for its registrations.
    pub async fn spawn(config: &InstanceConfig, db: Arc<DbProxy>) -> Result<Arc<Self>> {
        let module_path = config
            .guest_module
            .clone()
            .ok_or_else(|| Error::Internal("guest instance has no module path".into()))?;
        let cross = Arc::new(CrossServiceClient::new(config)?);

        let mut env = HashMap::new();
        env.insert("MANOR_INSTANCE_ID".to_string(), config.instance_id.clone());
        env.insert("MANOR_HOST_NAME".to_string(), config.host_name.clone());
        env.insert("HOST".to_string(), config.public_domain.clone());

        let state = HostState {
            instance_id: config.instance_id.clone(),
            env,
            alloc: PagePool::new(),
            routes: HashMap::new(),
            event_handlers: Vec::new(),
            response: None,
            event_error: None,
            abi_version: None,
            db,
            cross,
            rt: tokio::runtime::Handle::current(),
        };

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (boot_tx, boot_rx) = oneshot::channel();
        let thread_name = format!("guest-{}", config.instance_id);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker(&module_path, state, jobs_rx, boot_tx))
            .map_err(|e| Error::Internal(format!("failed to spawn guest worker: {}", e)))?;

        let boot = boot_rx
            .await
            .map_err(|_| Error::Guest("guest worker exited during boot".into()))??;

        tracing::info!(
            "guest module loaded: {} request handler(s), {} event handler(s)",
            boot.routes.len(),
            boot.event_handlers.len()
        );

        Ok(Arc::new(Self {
            jobs: jobs_tx,
            routes: boot.routes,
            event_handlers: boot.event_handlers,
        }))
    }

    /// Handler id registered for an exact request path, if any.
    pub fn handler_for(&self, path: &str) -> Option<i32> {
        self.routes.get(path).copied()
    }

    /// Event handler registrations in the order the guest made them.
    pub fn event_handlers(&self) -> &[(String, i32)] {
        &self.event_handlers
    }

    /// Run one HTTP request through the guest.
    pub async fn handle_request(
        &self,
        handler_id: i32,
        request: &GuestHttpRequest,
    ) -> Result<GuestHttpResponse> {
        let body = serde_json::to_vec(request)
            .map_err(|e| Error::Internal(format!("unencodable guest request: {}", e)))?;
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Request {
                body,
                handler_id,
                reply,
            })
            .map_err(|_| Error::Guest("guest worker is gone".into()))?;
        rx.await
            .map_err(|_| Error::Guest("guest worker dropped the request".into()))?
    }

    /// Dispatch one event into the guest, inside the publish transaction
    /// named by `tx_id`. Returns whether the guest changed state.
    pub async fn dispatch_event(
        &self,
        handler_id: i32,
        payload: &JsonValue,
        tx_id: u64,
    ) -> Result<bool> {
        let payload = serde_json::to_vec(payload)
            .map_err(|e| Error::Internal(format!("unencodable event payload: {}", e)))?;
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Event {
                payload,
                tx_id,
                handler_id,
                reply,
            })
            .map_err(|_| Error::Guest("guest worker is gone".into()))?;
        rx.await
            .map_err(|_| Error::Guest("guest worker dropped the event".into()))?
    }
}

/// Adapter exposing a guest event registration as a store handler.
pub struct GuestEventHandler {
    host: Arc<SandboxHost>,
    handler_id: i32,
}

#[async_trait]
impl EventHandler for GuestEventHandler {
    async fn apply(&self, _db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
        self.host.dispatch_event(self.handler_id, payload, tx_id).await
    }
}

/// Install every guest event registration into a handler registry.
pub fn register_guest_event_handlers(
    registry: &mut crate::events::HandlerRegistry,
    host: &Arc<SandboxHost>,
) {
    for (event_type, handler_id) in host.event_handlers() {
        registry.register(
            event_type.clone(),
            Arc::new(GuestEventHandler {
                host: host.clone(),
                handler_id: *handler_id,
            }),
        );
    }
}

struct GuestFns {
    memory: Memory,
    alloc_page: TypedFunc<(), i32>,
    handle_request: TypedFunc<(i32, i32, i32), i32>,
    handle_event: TypedFunc<(i32, i32, i32, i32, i32), i32>,
}

fn worker(
    module_path: &Path,
    state: HostState,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    boot: oneshot::Sender<Result<BootInfo>>,
) {
    let (mut store, guest) = match init_guest(module_path, state) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = boot.send(Err(e));
            return;
        }
    };

    let info = BootInfo {
        routes: store.data().routes.clone(),
        event_handlers: store.data().event_handlers.clone(),
    };
    if boot.send(Ok(info)).is_err() {
        return;
    }

    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Request {
                body,
                handler_id,
                reply,
            } => {
                let result = call_request(&mut store, &guest, &body, handler_id);
                let _ = reply.send(result);
            }
            Job::Event {
                payload,
                tx_id,
                handler_id,
                reply,
            } => {
                let result = call_event(&mut store, &guest, &payload, tx_id, handler_id);
                let _ = reply.send(result);
            }
        }
    }
}

fn init_guest(module_path: &Path, state: HostState) -> Result<(Store<HostState>, GuestFns)> {
    let engine = Engine::default();
    let module = Module::from_file(&engine, module_path).map_err(|e| {
        Error::Guest(format!(
            "failed to load guest module '{}': {}",
            module_path.display(),
            e
        ))
    })?;

    let mut linker: Linker<HostState> = Linker::new(&engine);
    imports::register(&mut linker)
        .map_err(|e| Error::Internal(format!("failed to build import surface: {}", e)))?;

    let mut store = Store::new(&engine, state);
    // The start function runs here; the guest announces its ABI version and
    // registers its handlers before we return.
    let instance: Instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| Error::Guest(format!("guest instantiation failed: {}", e)))?;

    let memory = instance
        .get_memory(&mut store, "memory")
        .ok_or_else(|| Error::Guest("guest does not export memory".into()))?;
    let alloc_page = instance
        .get_typed_func::<(), i32>(&mut store, "alloc_page")
        .map_err(|e| Error::Guest(format!("guest does not export alloc_page: {}", e)))?;
    let handle_request = instance
        .get_typed_func::<(i32, i32, i32), i32>(&mut store, "handle_request")
        .map_err(|e| Error::Guest(format!("guest does not export handle_request: {}", e)))?;
    let handle_event = instance
        .get_typed_func::<(i32, i32, i32, i32, i32), i32>(&mut store, "handle_event")
        .map_err(|e| Error::Guest(format!("guest does not export handle_event: {}", e)))?;

    if store.data().abi_version.is_none() {
        return Err(Error::Guest(
            "guest never called init_module during start".into(),
        ));
    }

    Ok((
        store,
        GuestFns {
            memory,
            alloc_page,
            handle_request,
            handle_event,
        },
    ))
}

fn call_request(
    store: &mut Store<HostState>,
    guest: &GuestFns,
    body: &[u8],
    handler_id: i32,
) -> Result<GuestHttpResponse> {
    store.data_mut().response = None;
    store.data_mut().alloc.begin_call();
    let result = call_request_inner(store, guest, body, handler_id);
    store.data_mut().alloc.end_call();
    result
}

fn call_request_inner(
    store: &mut Store<HostState>,
    guest: &GuestFns,
    body: &[u8],
    handler_id: i32,
) -> Result<GuestHttpResponse> {
    let (ptr, len) = imports::copy_into_guest(store, guest.memory, guest.alloc_page.clone(), body)?;
    let rc = guest
        .handle_request
        .call(&mut *store, (ptr as i32, len as i32, handler_id))
        .map_err(|e| Error::Guest(format!("guest trapped: {}", e)))?;
    if rc != 0 {
        return Err(Error::Guest(format!(
            "request handler {} returned {}",
            handler_id, rc
        )));
    }
    let bytes = store
        .data_mut()
        .response
        .take()
        .ok_or_else(|| Error::Guest(format!("request handler {} wrote no response", handler_id)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Guest(format!("guest wrote a malformed response: {}", e)))
}

fn call_event(
    store: &mut Store<HostState>,
    guest: &GuestFns,
    payload: &[u8],
    tx_id: u64,
    handler_id: i32,
) -> Result<bool> {
    store.data_mut().event_error = None;
    store.data_mut().alloc.begin_call();
    let result = call_event_inner(store, guest, payload, tx_id, handler_id);
    store.data_mut().alloc.end_call();
    result
}

fn call_event_inner(
    store: &mut Store<HostState>,
    guest: &GuestFns,
    payload: &[u8],
    tx_id: u64,
    handler_id: i32,
) -> Result<bool> {
    let (pp, pl) = imports::copy_into_guest(store, guest.memory, guest.alloc_page.clone(), payload)?;
    let tx_text = tx_id.to_string();
    let (tp, tl) = imports::copy_into_guest(
        store,
        guest.memory,
        guest.alloc_page.clone(),
        tx_text.as_bytes(),
    )?;

    let rc = guest
        .handle_event
        .call(
            &mut *store,
            (pp as i32, pl as i32, tp as i32, tl as i32, handler_id),
        )
        .map_err(|e| Error::Guest(format!("guest trapped in event handler: {}", e)))?;

    match rc {
        1 => Ok(true),
        0 => Ok(false),
        -1 => {
            let detail = store
                .data_mut()
                .event_error
                .take()
                .unwrap_or_else(|| "event handler failed".to_string());
            Err(Error::Guest(detail))
        }
        other => Err(Error::Guest(format!(
            "event handler {} returned unexpected code {}",
            handler_id, other
        ))),
    }
}
