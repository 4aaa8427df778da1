//! HTTP front of the live widget coordinator.
//!
//! Exposes a `SessionRegistry` as JSON endpoints plus a server-sent event
//! stream of collaboration events per session.
//!
//! # Environment Variables
//!
//! - `LIVE_ADDR`: Server bind address (default: 127.0.0.1:8011)
//! - `LIVE_REQUEST_TIMEOUT_SEC`: Deadline of each coordinator call (default: 60)
//! - `LOG_FORMAT`: `json` for JSON log lines
//! - `RUST_LOG`: log filter (default: info)

pub mod config;
pub mod error;
pub mod logging;
pub mod server;

pub use config::ServerConfig;
pub use error::{FrontError, Result};
pub use server::{boot_widget_server, router, serve, AppState};
