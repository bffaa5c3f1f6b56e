//! BeadHub HTTP server.
//!
//! Multi-tenant coordination hub for fleets of coding agents sharing Git
//! repositories: identity and tenant scoping, workspace registry + presence,
//! exclusive bead claims, issue sync with a transactional notification
//! outbox, and Redis-pub/sub-backed SSE streams for dashboards.
//!
//! Embed with [`app::create_state_with`] + [`app::build_router`] (library
//! mode, host-owned connections) or run the `beadhub` binary (standalone
//! mode).

pub mod app;
pub mod auth;
pub mod error;
pub mod internal_auth;
pub mod mutation_hooks;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use app::{build_router, create_state_standalone, create_state_with};
pub use error::{ApiError, ApiResult};
pub use state::{AppState, SharedState};
