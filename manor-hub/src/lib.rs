//! The manor hub
//!
//! A multi-tenant application host: one process that terminates HTTPS for a
//! family of logical applications, authenticates users against the central
//! identity store, enforces per-application access rules, and reverse-
//! proxies each request to the owning application instance. The hub also
//! owns session and refresh-token lifecycle, the audit log, the instance
//! subprocess fleet, and the per-instance package store.
//!
//! Structure: [`proxy`] is the request path, [`sessions`] and [`audit`]
//! the token machinery, [`procman`] and [`packages`] the fleet machinery,
//! all glued together by the [`state::HubContext`] built in `main`.

pub mod audit;
pub mod config;
pub mod error;
pub mod packages;
pub mod procman;
pub mod proxy;
pub mod sessions;
pub mod state;
pub mod tls;

pub use config::HubConfig;
pub use error::{Error, Result};
