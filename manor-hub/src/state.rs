//! The hub context
//!
//! One context owned by `main` packages every process-wide collaborator —
//! routing table, session manager, audit log, package store, instance
//! runtime map — and is injected into each component explicitly.

use std::sync::Arc;

use dashmap::DashMap;
use manor_wire::{
    CheckAccessRequest, CheckAccessResponse, DoLoginRequest, DoLoginResponse,
    InstanceDescriptor, ListInstancesResponse,
};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::audit::AuditLog;
use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::packages::PackageManager;
use crate::sessions::SessionManager;

/// One entry in the host-name routing table, published by the process
/// manager after a successful health probe.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub instance_id: String,
    pub host_name: String,
    /// `http://127.0.0.1:<port>`
    pub local_addr: String,
    pub current_event_id: i64,
}

/// Read-mostly host → instance map plus an instance-id index.
#[derive(Default)]
pub struct RouteTable {
    by_host: DashMap<String, RouteEntry>,
    host_of_instance: DashMap<String, String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish or refresh an entry. A renamed host drops its old mapping.
    pub fn publish(&self, entry: RouteEntry) {
        if let Some(previous) = self
            .host_of_instance
            .insert(entry.instance_id.clone(), entry.host_name.clone())
        {
            if previous != entry.host_name {
                self.by_host.remove(&previous);
            }
        }
        self.by_host.insert(entry.host_name.clone(), entry);
    }

    /// Drop an instance from routing.
    pub fn remove(&self, instance_id: &str) {
        if let Some((_, host)) = self.host_of_instance.remove(instance_id) {
            self.by_host.remove(&host);
        }
    }

    pub fn resolve_host(&self, host: &str) -> Option<RouteEntry> {
        self.by_host.get(host).map(|e| e.clone())
    }

    pub fn resolve_instance(&self, instance_id: &str) -> Option<RouteEntry> {
        let host = self.host_of_instance.get(instance_id)?.clone();
        self.resolve_host(&host)
    }
}

/// Live process-manager state for one instance, surfaced by the debug API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceRuntime {
    pub port: u16,
    pub healthy: bool,
    pub restarts: u32,
    pub consecutive_failures: u32,
}

/// Process-wide hub state, built once in `main`.
pub struct HubContext {
    pub config: Arc<HubConfig>,
    pub routes: Arc<RouteTable>,
    pub sessions: Arc<SessionManager>,
    pub audit: Arc<AuditLog>,
    pub packages: Arc<PackageManager>,
    pub runtime: Arc<DashMap<String, InstanceRuntime>>,
    pub http: reqwest::Client,
    /// Asks the process manager to probe an instance out of cycle.
    pub probe_nudge: mpsc::UnboundedSender<String>,
}

impl HubContext {
    /// POST a JSON RPC to the admin instance over its loopback address.
    async fn admin_rpc<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let entry = self
            .routes
            .resolve_instance("admin")
            .ok_or_else(|| Error::Unavailable("admin instance is not running".into()))?;

        let response = self
            .http
            .post(format!("{}{}", entry.local_addr, path))
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", self.config.internal_secret),
            )
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("admin RPC {} failed: {}", path, e)))?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "admin RPC {} answered {}",
                path,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("admin RPC {} sent malformed JSON: {}", path, e)))
    }

    /// Verify credentials against the identity store.
    pub async fn dologin(&self, username: &str, password: &str) -> Result<Option<i64>> {
        let response: DoLoginResponse = self
            .admin_rpc(
                "/internal/dologin",
                &DoLoginRequest {
                    username: username.to_string(),
                    password: password.to_string(),
                },
            )
            .await?;
        Ok(response.success.then_some(response.user_id))
    }

    /// Evaluate the access rules for a user against an application.
    pub async fn check_access(&self, user_id: i64, application_id: &str) -> Result<bool> {
        let response: CheckAccessResponse = self
            .admin_rpc(
                "/internal/checkAccess",
                &CheckAccessRequest {
                    user_id,
                    application_id: application_id.to_string(),
                },
            )
            .await?;
        Ok(response.access_granted)
    }

    /// Fetch the deployed-instance list from the identity store.
    pub async fn list_instances(&self) -> Result<Vec<InstanceDescriptor>> {
        let response: ListInstancesResponse = self
            .admin_rpc("/internal/listInstances", &serde_json::json!({}))
            .await?;
        Ok(response.instances)
    }

    /// Ask for an immediate health probe of one instance.
    pub fn nudge_probe(&self, instance_id: &str) {
        let _ = self.probe_nudge.send(instance_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(instance_id: &str, host: &str, port: u16) -> RouteEntry {
        RouteEntry {
            instance_id: instance_id.into(),
            host_name: host.into(),
            local_addr: format!("http://127.0.0.1:{}", port),
            current_event_id: 0,
        }
    }

    #[test]
    fn publish_and_resolve_by_host_and_instance() {
        let table = RouteTable::new();
        table.publish(entry("admin", "admin.example.test", 9101));

        let by_host = table.resolve_host("admin.example.test").unwrap();
        assert_eq!(by_host.instance_id, "admin");
        let by_instance = table.resolve_instance("admin").unwrap();
        assert_eq!(by_instance.local_addr, "http://127.0.0.1:9101");
    }

    #[test]
    fn republish_moves_a_renamed_host() {
        let table = RouteTable::new();
        table.publish(entry("notes", "notes.example.test", 9102));
        table.publish(entry("notes", "docs.example.test", 9102));

        assert!(table.resolve_host("notes.example.test").is_none());
        assert!(table.resolve_host("docs.example.test").is_some());
        assert_eq!(
            table.resolve_instance("notes").unwrap().host_name,
            "docs.example.test"
        );
    }

    #[test]
    fn remove_clears_both_indexes() {
        let table = RouteTable::new();
        table.publish(entry("notes", "notes.example.test", 9102));
        table.remove("notes");
        assert!(table.resolve_host("notes.example.test").is_none());
        assert!(table.resolve_instance("notes").is_none());
    }
}
