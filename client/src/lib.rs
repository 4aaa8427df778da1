//! Client side of a live widget session.
//!
//! `SessionClient` keeps a local, optimistic copy of every widget in a
//! `WidgetRegistry` and routes value changes through the `UpdateScheduler`
//! state machine before they reach the coordinator via a `CoordinatorApi`
//! transport (in-process or HTTP).

pub mod client;

pub use client::registry::{ClientWidget, WidgetRegistry, WidgetStatus};
pub use client::scheduler::{Phase, UpdateScheduler};
pub use client::session::SessionClient;
pub use client::transport::http::HttpCoordinator;
pub use client::transport::local::InProcessCoordinator;
pub use client::transport::CoordinatorApi;
pub use client::SchedulerConfig;
