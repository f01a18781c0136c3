//! In-cluster operator agent.
//!
//! Receives commands from the control plane over a supervised websocket (or
//! the REST API), queues them for the worker pool, tracks runtime agent
//! health in safe mode, and periodically asks node agents to refresh their
//! rules.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod kube;
pub mod notification;
pub mod reporter;
pub mod rulesupdate;
pub mod safemode;
pub mod state;

pub use state::AppState;
