//! Process lifecycle manager
//!
//! Keeps one running subprocess per active application instance. A
//! reconcile loop compares the desired set (core instances plus whatever
//! the admin instance lists, gated by active packages) against running
//! children, spawning and stopping as needed. A probe loop hits each
//! child's `/api/status`; successes publish the instance into the routing
//! table, repeated misses restart the child with capped exponential
//! backoff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use manor_wire::{InstanceDescriptor, StatusResponse};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::state::{HubContext, InstanceRuntime, RouteEntry};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct ManagedChild {
    descriptor: InstanceDescriptor,
    port: u16,
    child: tokio::process::Child,
    consecutive_failures: u32,
    restarts: u32,
}

/// Cooldown for an instance awaiting respawn after a restart.
struct Cooldown {
    until: Instant,
    restarts: u32,
}

struct PortAllocator {
    start: u16,
    end: u16,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            in_use: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> Result<u16> {
        for port in self.start..=self.end {
            if self.in_use.insert(port) {
                return Ok(port);
            }
        }
        Err(Error::Internal("instance port range exhausted".into()))
    }

    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

/// Exponential backoff for the nth restart, capped at the ceiling.
fn backoff_duration(restarts: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exp = restarts.min(16);
    let secs = base_secs.saturating_mul(2u64.saturating_pow(exp)).min(cap_secs);
    Duration::from_secs(secs)
}

/// The manager itself. Owned by one background task spawned from `main`.
pub struct ProcessManager {
    ctx: Arc<HubContext>,
    children: Mutex<HashMap<String, ManagedChild>>,
    cooldowns: Mutex<HashMap<String, Cooldown>>,
    ports: Mutex<PortAllocator>,
}

impl ProcessManager {
    pub fn new(ctx: Arc<HubContext>) -> Self {
        let ports = PortAllocator::new(
            ctx.config.port_range_start,
            ctx.config.port_range_end,
        );
        Self {
            ctx,
            children: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            ports: Mutex::new(ports),
        }
    }

    /// Reconcile and probe until shutdown, then stop every child.
    pub async fn run(
        self: Arc<Self>,
        mut nudges: mpsc::UnboundedReceiver<String>,
        shutdown: CancellationToken,
    ) {
        let mut reconcile =
            tokio::time::interval(Duration::from_secs(self.ctx.config.reconcile_interval_secs));
        let mut probe =
            tokio::time::interval(Duration::from_secs(self.ctx.config.probe_interval_secs));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::warn!("reconcile pass failed: {}", e);
                    }
                }
                _ = probe.tick() => self.probe_all().await,
                Some(instance_id) = nudges.recv() => self.probe_one(&instance_id).await,
            }
        }

        self.stop_all().await;
    }

    /// The set of instances that should be running right now.
    async fn desired_instances(&self) -> Vec<(InstanceDescriptor, &'static str)> {
        let domain = &self.ctx.config.domain;
        let mut desired = vec![
            (
                InstanceDescriptor {
                    instance_id: "admin".into(),
                    app_id: "manor-admin".into(),
                    display_name: "Administration".into(),
                    host_name: format!("admin.{}", domain),
                    db_name: "admin.db".into(),
                },
                "admin",
            ),
            (
                InstanceDescriptor {
                    instance_id: "login".into(),
                    app_id: "manor-login".into(),
                    display_name: "Login".into(),
                    host_name: format!("login.{}", domain),
                    db_name: "login.db".into(),
                },
                "login",
            ),
        ];

        // Until the admin instance answers probes there is nothing to ask.
        if self.ctx.routes.resolve_instance("admin").is_some() {
            match self.ctx.list_instances().await {
                Ok(instances) => {
                    for descriptor in instances {
                        if desired
                            .iter()
                            .any(|(d, _)| d.instance_id == descriptor.instance_id)
                        {
                            continue;
                        }
                        if self.ctx.packages.is_active(&descriptor.instance_id) {
                            desired.push((descriptor, "guest"));
                        }
                    }
                }
                Err(e) => tracing::warn!("could not list instances: {}", e),
            }
        }

        desired
    }

    async fn reconcile(&self) -> Result<()> {
        let desired: HashMap<String, (InstanceDescriptor, &'static str)> = self
            .desired_instances()
            .await
            .into_iter()
            .map(|(d, kind)| (d.instance_id.clone(), (d, kind)))
            .collect();

        // Stop children that fell out of the desired set.
        let to_stop: Vec<String> = {
            let children = self.children.lock().await;
            children
                .keys()
                .filter(|id| !desired.contains_key(*id))
                .cloned()
                .collect()
        };
        for instance_id in to_stop {
            tracing::info!("instance {} no longer desired, stopping", instance_id);
            self.stop_child(&instance_id).await;
        }

        // Start what is missing, unless it is cooling down.
        for (instance_id, (descriptor, kind)) in desired {
            let already_running = self.children.lock().await.contains_key(&instance_id);
            if already_running {
                continue;
            }
            let restarts = {
                let mut cooldowns = self.cooldowns.lock().await;
                match cooldowns.get(&instance_id) {
                    Some(cooldown) if Instant::now() < cooldown.until => continue,
                    Some(cooldown) => {
                        let restarts = cooldown.restarts;
                        cooldowns.remove(&instance_id);
                        restarts
                    }
                    None => 0,
                }
            };
            if let Err(e) = self.spawn_child(descriptor, kind, restarts).await {
                tracing::error!("failed to start instance {}: {}", instance_id, e);
            }
        }

        Ok(())
    }

    async fn spawn_child(
        &self,
        descriptor: InstanceDescriptor,
        kind: &'static str,
        restarts: u32,
    ) -> Result<()> {
        let port = self.ports.lock().await.allocate()?;
        let config = &self.ctx.config;
        let db_path = config.data_dir.join(&descriptor.db_name);
        let internal_base_url = format!("https://internal.{}:{}", config.domain, config.listen_port);

        let mut command = tokio::process::Command::new(&config.instance_binary);
        command
            .arg("--instance-id")
            .arg(&descriptor.instance_id)
            .arg("--host-name")
            .arg(&descriptor.host_name)
            .arg("--db-path")
            .arg(&db_path)
            .arg("--port")
            .arg(port.to_string())
            .arg("--app")
            .arg(kind)
            .arg("--public-domain")
            .arg(&config.domain)
            .arg("--internal-base-url")
            .arg(&internal_base_url)
            .env("INTERNAL_SECRET", &config.internal_secret)
            .kill_on_drop(true);
        if kind == "guest" {
            command
                .arg("--guest-module")
                .arg(self.ctx.packages.package_path(&descriptor.instance_id));
        }

        let child = command.spawn().map_err(|e| {
            Error::Internal(format!(
                "failed to spawn '{}': {}",
                config.instance_binary.display(),
                e
            ))
        })?;

        tracing::info!(
            "spawned instance {} ({}) on port {} (pid {:?})",
            descriptor.instance_id,
            kind,
            port,
            child.id()
        );

        self.ctx.runtime.insert(
            descriptor.instance_id.clone(),
            InstanceRuntime {
                port,
                healthy: false,
                restarts,
                consecutive_failures: 0,
            },
        );
        self.children.lock().await.insert(
            descriptor.instance_id.clone(),
            ManagedChild {
                descriptor,
                port,
                child,
                consecutive_failures: 0,
                restarts,
            },
        );
        Ok(())
    }

    async fn probe_all(&self) {
        let ids: Vec<String> = self.children.lock().await.keys().cloned().collect();
        for instance_id in ids {
            self.probe_one(&instance_id).await;
        }
    }

    async fn probe_one(&self, instance_id: &str) {
        let target = {
            let children = self.children.lock().await;
            children.get(instance_id).map(|child| {
                (
                    child.port,
                    child.descriptor.host_name.clone(),
                    child.restarts,
                )
            })
        };
        let Some((port, host_name, _)) = target else {
            return;
        };

        let local_addr = format!("http://127.0.0.1:{}", port);
        let probe = self
            .ctx
            .http
            .get(format!("{}/api/status", local_addr))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        let status: Option<StatusResponse> = match probe {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            _ => None,
        };

        match status {
            Some(status) => {
                self.ctx.routes.publish(RouteEntry {
                    instance_id: instance_id.to_string(),
                    host_name,
                    local_addr,
                    current_event_id: status.current_event_id,
                });
                let mut children = self.children.lock().await;
                if let Some(child) = children.get_mut(instance_id) {
                    child.consecutive_failures = 0;
                    self.ctx.runtime.insert(
                        instance_id.to_string(),
                        InstanceRuntime {
                            port: child.port,
                            healthy: true,
                            restarts: child.restarts,
                            consecutive_failures: 0,
                        },
                    );
                }
            }
            None => {
                let must_restart = {
                    let mut children = self.children.lock().await;
                    match children.get_mut(instance_id) {
                        Some(child) => {
                            child.consecutive_failures += 1;
                            self.ctx.runtime.insert(
                                instance_id.to_string(),
                                InstanceRuntime {
                                    port: child.port,
                                    healthy: false,
                                    restarts: child.restarts,
                                    consecutive_failures: child.consecutive_failures,
                                },
                            );
                            child.consecutive_failures
                                >= self.ctx.config.probe_failure_threshold
                        }
                        None => false,
                    }
                };
                if must_restart {
                    self.restart_child(instance_id).await;
                }
            }
        }
    }

    /// Kill a misbehaving child and schedule its respawn with backoff.
    async fn restart_child(&self, instance_id: &str) {
        let Some(mut child) = self.children.lock().await.remove(instance_id) else {
            return;
        };
        let restarts = child.restarts + 1;
        let backoff = backoff_duration(
            child.restarts,
            self.ctx.config.restart_backoff_base_secs,
            self.ctx.config.restart_backoff_cap_secs,
        );
        tracing::warn!(
            "instance {} missed {} probes; restarting in {:?} (restart #{})",
            instance_id,
            child.consecutive_failures,
            backoff,
            restarts
        );

        if let Err(e) = child.child.kill().await {
            tracing::warn!("kill of {} failed: {}", instance_id, e);
        }
        self.ports.lock().await.release(child.port);
        self.ctx.routes.remove(instance_id);
        self.ctx.runtime.insert(
            instance_id.to_string(),
            InstanceRuntime {
                port: 0,
                healthy: false,
                restarts,
                consecutive_failures: child.consecutive_failures,
            },
        );
        self.cooldowns.lock().await.insert(
            instance_id.to_string(),
            Cooldown {
                until: Instant::now() + backoff,
                restarts,
            },
        );
    }

    /// Graceful stop: ask over the internal channel, then kill after the
    /// timeout.
    async fn stop_child(&self, instance_id: &str) {
        let Some(mut child) = self.children.lock().await.remove(instance_id) else {
            return;
        };

        let shutdown_url = format!("http://127.0.0.1:{}/internal/shutdown", child.port);
        let asked = self
            .ctx
            .http
            .post(&shutdown_url)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", self.ctx.config.internal_secret),
            )
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok();

        if asked {
            match tokio::time::timeout(STOP_TIMEOUT, child.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!("instance {} exited: {}", instance_id, status);
                }
                _ => {
                    tracing::warn!("instance {} ignored shutdown, killing", instance_id);
                    let _ = child.child.kill().await;
                }
            }
        } else if let Err(e) = child.child.kill().await {
            tracing::warn!("kill of {} failed: {}", instance_id, e);
        }

        self.ports.lock().await.release(child.port);
        self.ctx.routes.remove(instance_id);
        self.ctx.runtime.remove(instance_id);
    }

    async fn stop_all(&self) {
        let ids: Vec<String> = self.children.lock().await.keys().cloned().collect();
        for instance_id in ids {
            self.stop_child(&instance_id).await;
        }
        tracing::info!("all instances stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_allocate_and_release() {
        let mut ports = PortAllocator::new(9100, 9102);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        let c = ports.allocate().unwrap();
        assert_eq!((a, b, c), (9100, 9101, 9102));
        assert!(ports.allocate().is_err());

        ports.release(b);
        assert_eq!(ports.allocate().unwrap(), 9101);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_duration(0, 2, 60), Duration::from_secs(2));
        assert_eq!(backoff_duration(1, 2, 60), Duration::from_secs(4));
        assert_eq!(backoff_duration(3, 2, 60), Duration::from_secs(16));
        assert_eq!(backoff_duration(10, 2, 60), Duration::from_secs(60));
        // Large restart counts stay at the ceiling instead of overflowing.
        assert_eq!(backoff_duration(u32::MAX, 2, 60), Duration::from_secs(60));
    }
}
