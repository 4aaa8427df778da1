//! HTTP server components.

pub mod http;

pub use http::{boot_widget_server, router, serve, AppState};
