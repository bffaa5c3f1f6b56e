//! Shared database infrastructure.
//!
//! Owns (or borrows) the single Postgres pool all schemas share. Standalone
//! mode connects and migrates; library mode receives an already-connected
//! pool from the host application and still applies pending migrations so
//! both startup orderings converge on the same schema.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbResult;

/// Default per-statement timeout applied to every pooled connection.
const STATEMENT_TIMEOUT_MS: u32 = 30_000;

#[derive(Clone)]
pub struct DatabaseInfra {
    pool: PgPool,
    owns_pool: bool,
    instance_id: uuid::Uuid,
}

impl DatabaseInfra {
    /// Standalone mode: create a pool from a connection string and apply
    /// migrations. On any failure nothing is retained — the pool is closed
    /// before the error propagates, so a failed initialization never leaks a
    /// half-open pool.
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(10))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {STATEMENT_TIMEOUT_MS}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await
            .map_err(crate::DbError::from)?;

        let infra = Self {
            pool,
            owns_pool: true,
            instance_id: uuid::Uuid::new_v4(),
        };
        if let Err(err) = infra.migrate().await {
            infra.pool.close().await;
            return Err(err);
        }
        info!("database initialized");
        Ok(infra)
    }

    /// Library mode: adopt a host-provided pool. The host owns the pool's
    /// lifecycle; [`DatabaseInfra::close`] becomes a no-op.
    pub async fn from_pool(pool: PgPool) -> DbResult<Self> {
        let infra = Self {
            pool,
            owns_pool: false,
            instance_id: uuid::Uuid::new_v4(),
        };
        infra.migrate().await?;
        Ok(infra)
    }

    async fn migrate(&self) -> DbResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Stable identity for this infra instance (stable across clones), used
    /// to scope in-process caches so two infras never share entries.
    pub fn instance_id(&self) -> uuid::Uuid {
        self.instance_id
    }

    /// Close the pool in standalone mode; no-op when the host owns it.
    pub async fn close(&self) {
        if self.owns_pool {
            self.pool.close().await;
        }
    }

    /// Liveness probe: `SELECT 1`.
    pub async fn ping(&self) -> DbResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(crate::DbError::from)?;
        Ok(())
    }
}
