//! Shared application state for all HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use bh_core::Settings;
use bh_db::outbox::MailSender;
use bh_db::DatabaseInfra;

/// TTL for the cached `/status` workspace-id sets. Short, so SSE-driven
/// status polling stays fresh while the database is spared one query per
/// poll.
pub const WORKSPACE_IDS_CACHE_TTL_SECS: u64 = 10;

pub struct WorkspaceIdsCacheEntry {
    pub workspace_ids: Vec<Uuid>,
    pub fetched_at: Instant,
    pub limit: i64,
}

pub struct AppState {
    pub db: DatabaseInfra,
    /// Multiplexed connection for regular Redis commands.
    pub redis: ConnectionManager,
    /// Raw client, needed because pub/sub subscriptions require dedicated
    /// connections.
    pub redis_client: redis::Client,
    pub settings: Settings,
    pub mail: Arc<dyn MailSender>,
    /// Keyed by (db instance, project, limit) so two infras never share
    /// entries.
    pub workspace_ids_cache: DashMap<(Uuid, Uuid, i64), WorkspaceIdsCacheEntry>,
}

impl AppState {
    pub fn new(
        db: DatabaseInfra,
        redis: ConnectionManager,
        redis_client: redis::Client,
        settings: Settings,
        mail: Arc<dyn MailSender>,
    ) -> Self {
        Self {
            db,
            redis,
            redis_client,
            settings,
            mail,
            workspace_ids_cache: DashMap::new(),
        }
    }

    /// A fresh handle to the command connection. Cloning the manager is
    /// cheap; the underlying connection is shared and reconnects itself.
    pub fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

pub type SharedState = Arc<AppState>;
