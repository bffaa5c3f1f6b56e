//! Authoritative SQL state for the coordination hub.
//!
//! One shared Postgres pool, three schemas:
//! - `server` — workspaces, repos, claims, subscriptions, escalations,
//!   notification outbox, audit log
//! - `beads` — synced issue snapshots
//! - `aweb` — identity (projects, agents, API keys) and the embedded mail
//!   store the outbox delivers into
//!
//! Every query carries `project_id` in its predicate; the tenant boundary is
//! enforced here, not in the HTTP layer.

pub mod audit;
pub mod bootstrap;
pub mod claims;
pub mod error;
pub mod escalations;
pub mod identity;
pub mod infra;
pub mod outbox;
pub mod registry;
pub mod subscriptions;
pub mod sync;

pub use error::DbError;
pub use infra::DatabaseInfra;

pub type DbResult<T> = Result<T, DbError>;
