//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: MANOR_HUB_)
//! 2. Config file: ./hub.toml
//! 3. Default values

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// TLS material for the public listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain
    pub cert_path: PathBuf,

    /// Path to the PEM private key
    pub key_path: PathBuf,
}

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Public domain; applications live on subdomains of it
    #[serde(default = "default_domain")]
    pub domain: String,

    /// HTTPS listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// TLS certificate material
    pub tls: TlsConfig,

    /// Shared secret for the internal RPC channel
    #[serde(default)]
    pub internal_secret: String,

    /// Root directory for hub state (databases, packages)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Path to the instance daemon binary
    #[serde(default = "default_instance_binary")]
    pub instance_binary: PathBuf,

    /// First loopback port handed to instances
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last loopback port handed to instances
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Seconds between health probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Consecutive probe misses before a restart
    #[serde(default = "default_probe_failures")]
    pub probe_failure_threshold: u32,

    /// Base of the restart backoff, in seconds
    #[serde(default = "default_backoff_base")]
    pub restart_backoff_base_secs: u64,

    /// Ceiling of the restart backoff, in seconds
    #[serde(default = "default_backoff_cap")]
    pub restart_backoff_cap_secs: u64,

    /// Seconds between reconcile passes over the desired instance set
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Access token lifetime, in seconds
    #[serde(default = "default_access_window")]
    pub access_window_secs: u64,

    /// Session lifetime for the administrator, in seconds
    #[serde(default = "default_admin_session_window")]
    pub session_window_admin_secs: u64,

    /// Session lifetime for everyone else, in seconds
    #[serde(default = "default_user_session_window")]
    pub session_window_user_secs: u64,

    /// Grace period a rotated-away refresh token stays valid, in seconds
    #[serde(default = "default_rotation_grace")]
    pub rotation_grace_secs: u64,

    /// Long-poll fan-out deadline, in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Verify backend certificates on non-loopback hops. All hops are
    /// loopback today; the knob is parsed and logged for forward
    /// compatibility.
    #[serde(default)]
    pub verify_backend_tls: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            listen_port: default_listen_port(),
            tls: TlsConfig {
                cert_path: PathBuf::from("./certs/hub.crt"),
                key_path: PathBuf::from("./certs/hub.key"),
            },
            internal_secret: String::new(),
            data_dir: default_data_dir(),
            instance_binary: default_instance_binary(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            probe_interval_secs: default_probe_interval(),
            probe_failure_threshold: default_probe_failures(),
            restart_backoff_base_secs: default_backoff_base(),
            restart_backoff_cap_secs: default_backoff_cap(),
            reconcile_interval_secs: default_reconcile_interval(),
            access_window_secs: default_access_window(),
            session_window_admin_secs: default_admin_session_window(),
            session_window_user_secs: default_user_session_window(),
            rotation_grace_secs: default_rotation_grace(),
            poll_timeout_secs: default_poll_timeout(),
            verify_backend_tls: false,
            log_level: default_log_level(),
        }
    }
}

impl HubConfig {
    /// Load configuration from file, environment, and defaults.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("hub.toml"))
            .merge(Env::prefixed("MANOR_HUB_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Reject configurations the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.internal_secret.is_empty() {
            return Err(Error::InvalidRequest(
                "internal_secret is required".into(),
            ));
        }
        if self.port_range_start >= self.port_range_end {
            return Err(Error::InvalidRequest(
                "instance port range is empty".into(),
            ));
        }
        Ok(())
    }

    /// Hostname of the login instance.
    pub fn login_host(&self) -> String {
        format!("login.{}", self.domain)
    }

    /// Hostname of the internal RPC channel.
    pub fn internal_host(&self) -> String {
        format!("internal.{}", self.domain)
    }

    /// Path of the hub's own database (sessions, audit).
    pub fn hub_db_path(&self) -> PathBuf {
        self.data_dir.join("hub.db")
    }

    /// Session window by role: the administrator gets the short window.
    pub fn session_window_for(&self, user_id: i64) -> Duration {
        if user_id == 1 {
            Duration::from_secs(self.session_window_admin_secs)
        } else {
            Duration::from_secs(self.session_window_user_secs)
        }
    }

    pub fn access_window(&self) -> Duration {
        Duration::from_secs(self.access_window_secs)
    }

    pub fn rotation_grace(&self) -> Duration {
        Duration::from_secs(self.rotation_grace_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_listen_port() -> u16 {
    8443
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_instance_binary() -> PathBuf {
    PathBuf::from("manor-instance")
}

fn default_port_range_start() -> u16 {
    9100
}

fn default_port_range_end() -> u16 {
    9199
}

fn default_probe_interval() -> u64 {
    5
}

fn default_probe_failures() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_cap() -> u64 {
    60
}

fn default_reconcile_interval() -> u64 {
    10
}

fn default_access_window() -> u64 {
    600
}

fn default_admin_session_window() -> u64 {
    3600
}

fn default_user_session_window() -> u64 {
    30 * 24 * 3600
}

fn default_rotation_grace() -> u64 {
    30
}

fn default_poll_timeout() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> HubConfig {
        HubConfig {
            internal_secret: "secret".into(),
            ..HubConfig::default()
        }
    }

    #[test]
    fn validate_requires_the_internal_secret() {
        assert!(HubConfig::default().validate().is_err());
        assert!(populated().validate().is_ok());
    }

    #[test]
    fn validate_rejects_an_empty_port_range() {
        let config = HubConfig {
            port_range_start: 9200,
            port_range_end: 9100,
            ..populated()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_hosts_follow_the_domain() {
        let config = HubConfig {
            domain: "example.test".into(),
            ..populated()
        };
        assert_eq!(config.login_host(), "login.example.test");
        assert_eq!(config.internal_host(), "internal.example.test");
    }

    #[test]
    fn session_windows_differ_by_role() {
        let config = populated();
        assert_eq!(config.session_window_for(1), Duration::from_secs(3600));
        assert_eq!(
            config.session_window_for(2),
            Duration::from_secs(30 * 24 * 3600)
        );
    }
}
