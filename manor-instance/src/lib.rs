//! Per-application instance daemon
//!
//! One of these processes runs for every active application instance,
//! spawned and supervised by the hub. It exclusively owns the instance's
//! database file and serves a loopback HTTP API: the append-only event log
//! (`/api/publish`, `/api/poll`, `/api/status`), the internal RPCs, and —
//! for guest applications — whatever request handlers the guest module
//! registered through the sandbox ABI.
//!
//! The core `admin` instance runs natively (no guest module): its event
//! handlers and the `dologin`/`checkAccess` RPCs live in [`admin`].

pub mod admin;
pub mod config;
pub mod db;
pub mod dbproxy;
pub mod error;
pub mod events;
pub mod http;
pub mod sandbox;

pub use config::{AppKind, InstanceConfig};
pub use error::{Error, Result};
