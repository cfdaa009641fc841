//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Command-line flags (applied by `main` after loading)
//! 2. Environment variables (prefix: MANOR_INSTANCE_)
//! 3. Config file: ./instance.toml
//! 4. Default values

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which application this instance process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Core identity service: users, applications, access rules.
    Admin,
    /// Core login servant; no handlers of its own.
    Login,
    /// A guest module loaded into the sandbox.
    Guest,
}

/// Instance daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Stable opaque id of this instance
    pub instance_id: String,

    /// External hostname this instance is routed under
    pub host_name: String,

    /// Path to the instance database file
    pub db_path: PathBuf,

    /// Loopback port to listen on
    pub port: u16,

    /// Which application to host
    #[serde(default = "default_app_kind")]
    pub app: AppKind,

    /// Path to the guest module (required when `app = "guest"`)
    #[serde(default)]
    pub guest_module: Option<PathBuf>,

    /// Public domain of the hub (used to derive core host names)
    #[serde(default = "default_domain")]
    pub public_domain: String,

    /// Base URL of the hub's internal host for cross-service calls
    #[serde(default)]
    pub internal_base_url: String,

    /// Shared secret for the internal RPC channel
    #[serde(default)]
    pub internal_secret: String,

    /// Accept the hub's certificate without verification on loopback hops
    #[serde(default = "default_true")]
    pub relax_internal_tls: bool,

    /// Long-poll timeout in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Cross-service request timeout in seconds
    #[serde(default = "default_cross_service_timeout")]
    pub cross_service_timeout_secs: u64,

    /// Maximum retry attempts when opening the database
    #[serde(default = "default_db_retries")]
    pub db_max_retries: u32,

    /// Delay between database open attempts in seconds
    #[serde(default = "default_db_retry_delay")]
    pub db_retry_delay_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            host_name: String::new(),
            db_path: PathBuf::new(),
            port: 0,
            app: default_app_kind(),
            guest_module: None,
            public_domain: default_domain(),
            internal_base_url: String::new(),
            internal_secret: String::new(),
            relax_internal_tls: true,
            poll_timeout_secs: default_poll_timeout(),
            cross_service_timeout_secs: default_cross_service_timeout(),
            db_max_retries: default_db_retries(),
            db_retry_delay_secs: default_db_retry_delay(),
            log_level: default_log_level(),
        }
    }
}

impl InstanceConfig {
    /// Load configuration from file, environment, and defaults.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("instance.toml"))
            .merge(Env::prefixed("MANOR_INSTANCE_"))
            .extract()?;
        Ok(config)
    }

    /// Reject configurations that cannot identify or persist the instance.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(Error::InvalidRequest("instance_id is required".into()));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::InvalidRequest("db_path is required".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidRequest("port is required".into()));
        }
        if self.app == AppKind::Guest && self.guest_module.is_none() {
            return Err(Error::InvalidRequest(
                "guest_module is required for guest instances".into(),
            ));
        }
        Ok(())
    }

    /// Poll timeout as a `Duration`.
    pub fn poll_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_timeout_secs)
    }
}

fn default_app_kind() -> AppKind {
    AppKind::Guest
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout() -> u64 {
    50
}

fn default_cross_service_timeout() -> u64 {
    5
}

fn default_db_retries() -> u32 {
    5
}

fn default_db_retry_delay() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}
