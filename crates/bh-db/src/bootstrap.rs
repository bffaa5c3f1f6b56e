//! Identity bootstrap: one idempotent flow behind `POST /v1/init`.
//!
//! Ensures the project, ensures the agent (reviving a soft-deleted row with
//! the same alias), and always mints a fresh API key. Repo/workspace creation
//! on top of this lives in the registry; the route composes the two.

use sqlx::PgPool;
use uuid::Uuid;

use crate::identity::{mint_api_key, MintedKey};
use crate::{DbError, DbResult};

#[derive(Debug, Clone)]
pub struct EnsuredProject {
    pub project_id: Uuid,
    pub slug: String,
    pub name: String,
}

/// Ensure an identity-schema project exists, by id when given, otherwise by
/// slug. Revives soft-deleted rows.
pub async fn ensure_project(
    pool: &PgPool,
    slug: &str,
    name: &str,
    project_id: Option<Uuid>,
    tenant_id: Option<Uuid>,
) -> DbResult<EnsuredProject> {
    let row: (Uuid, String, Option<String>) = match project_id {
        Some(id) => {
            sqlx::query_as(
                r#"
                INSERT INTO aweb.projects (project_id, tenant_id, slug, name)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (project_id)
                DO UPDATE SET slug = EXCLUDED.slug,
                              name = EXCLUDED.name,
                              deleted_at = NULL
                RETURNING project_id, slug, name
                "#,
            )
            .bind(id)
            .bind(tenant_id)
            .bind(slug)
            .bind(name)
            .fetch_one(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                r#"
                INSERT INTO aweb.projects (project_id, tenant_id, slug, name)
                VALUES (gen_random_uuid(), $1, $2, $3)
                ON CONFLICT (slug)
                DO UPDATE SET name = EXCLUDED.name, deleted_at = NULL
                RETURNING project_id, slug, name
                "#,
            )
            .bind(tenant_id)
            .bind(slug)
            .bind(name)
            .fetch_one(pool)
            .await?
        }
    };

    Ok(EnsuredProject {
        project_id: row.0,
        slug: row.1,
        name: row.2.unwrap_or_default(),
    })
}

/// Parameters for [`bootstrap_identity`].
#[derive(Debug, Clone)]
pub struct BootstrapArgs {
    pub project_slug: String,
    pub project_name: String,
    pub project_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub alias: String,
    pub human_name: String,
    pub agent_type: String,
    pub lifetime: String,
    /// `None` defaults to custodial (the server holds the signing key).
    pub custody: Option<String>,
}

/// Result of a bootstrap, including the raw API key (returned to the caller
/// exactly once).
#[derive(Debug)]
pub struct BootstrapIdentity {
    pub project_id: Uuid,
    pub project_slug: String,
    pub project_name: String,
    pub agent_id: Uuid,
    pub alias: String,
    pub api_key: String,
    /// True when the agent row was created by this call.
    pub created: bool,
    pub did: Option<String>,
    pub custody: Option<String>,
    pub lifetime: String,
}

/// Ensure project + agent and mint a fresh key. Idempotent per
/// `(project, alias)`: repeated calls reuse the agent and only the key is
/// new.
pub async fn bootstrap_identity(pool: &PgPool, args: BootstrapArgs) -> DbResult<BootstrapIdentity> {
    let project = ensure_project(
        pool,
        &args.project_slug,
        &args.project_name,
        args.project_id,
        args.tenant_id,
    )
    .await?;

    let custody = args.custody.unwrap_or_else(|| "custodial".to_string());

    let mut tx = pool.begin().await.map_err(DbError::from)?;

    let existing: Option<(Uuid, Option<String>, Option<String>, String)> = sqlx::query_as(
        r#"
        SELECT agent_id, did, custody, lifetime
        FROM aweb.agents
        WHERE project_id = $1 AND alias = $2
        "#,
    )
    .bind(project.project_id)
    .bind(&args.alias)
    .fetch_optional(&mut *tx)
    .await?;

    let (agent_id, did, custody, lifetime, created) = match existing {
        Some((agent_id, did, existing_custody, lifetime)) => {
            sqlx::query(
                r#"
                UPDATE aweb.agents
                SET deleted_at = NULL,
                    status = 'active',
                    human_name = $2
                WHERE agent_id = $1
                "#,
            )
            .bind(agent_id)
            .bind(&args.human_name)
            .execute(&mut *tx)
            .await?;
            (agent_id, did, existing_custody, lifetime, false)
        }
        None => {
            let agent_id = Uuid::new_v4();
            let did = format!("did:key:{}", Uuid::new_v4().simple());
            sqlx::query(
                r#"
                INSERT INTO aweb.agents
                    (agent_id, project_id, alias, human_name, agent_type, lifetime, custody, did)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(agent_id)
            .bind(project.project_id)
            .bind(&args.alias)
            .bind(&args.human_name)
            .bind(&args.agent_type)
            .bind(&args.lifetime)
            .bind(&custody)
            .bind(&did)
            .execute(&mut *tx)
            .await?;
            (
                agent_id,
                Some(did),
                Some(custody),
                args.lifetime.clone(),
                true,
            )
        }
    };

    let minted: MintedKey = mint_api_key();
    sqlx::query(
        r#"
        INSERT INTO aweb.api_keys (project_id, agent_id, key_prefix, key_hash)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(project.project_id)
    .bind(agent_id)
    .bind(&minted.key_prefix)
    .bind(&minted.key_hash)
    .execute(&mut *tx)
    .await?;

    tx.commit().await.map_err(DbError::from)?;

    Ok(BootstrapIdentity {
        project_id: project.project_id,
        project_slug: project.slug,
        project_name: project.name,
        agent_id,
        alias: args.alias,
        api_key: minted.token,
        created,
        did,
        custody,
        lifetime,
    })
}
