//! AFS Server - session workers and the API surface
//!
//! This crate wires the transactional engine into a serving process:
//! - Per-session workers drawn from a bounded pool
//! - The API server dispatching operations and 2PC lifecycle calls
//! - The authorization gate and the post-commit metadata registrar
//! - The maintenance loop (in-doubt expiry, stalled commits, checkpoints)

pub mod api;
pub mod auth;
pub mod context;
pub mod maintenance;
pub mod metadata;
pub mod session;

// Re-exports
pub use api::ApiServer;
pub use auth::{Action, AllowAll, Authorizer, CachingAuthorizer, Caller, CallerKind};
pub use context::ServerContext;
pub use maintenance::{MaintenanceReport, maintenance_pass, run_maintenance};
pub use metadata::MetadataRegistrar;
pub use session::WorkerMode;
