//! Workspace + repo registry (authoritative, `server` schema).
//!
//! A workspace's `(project_id, repo_id, alias)` triple is immutable after
//! creation; re-registration is allowed only when all three still match.
//! Aliases are unique per project among live workspaces — a partial unique
//! index enforces it, and [`alias_collision`] additionally probes the claims
//! table to cover the race window before a workspace row is persisted.

use chrono::{DateTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::{DbError, DbResult};

// ---------------------------------------------------------------------------
// Projects + repos
// ---------------------------------------------------------------------------

/// Mirror an identity-schema project into the coordination schema so FKs
/// resolve. Revives soft-deleted rows.
pub async fn upsert_server_project(
    pool: &PgPool,
    project_id: Uuid,
    slug: &str,
    name: Option<&str>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO server.projects (id, tenant_id, slug, name, deleted_at)
        VALUES ($1, NULL, $2, $3, NULL)
        ON CONFLICT (id)
        DO UPDATE SET slug = EXCLUDED.slug, name = EXCLUDED.name, deleted_at = NULL
        "#,
    )
    .bind(project_id)
    .bind(slug)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

/// Slug of a live coordination-schema project.
pub async fn project_slug(pool: &PgPool, project_id: Uuid) -> DbResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT slug FROM server.projects WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(s,)| s))
}

/// Tenant + slug for a live project; used to scope cloud-mode bootstrap.
pub async fn get_server_project(
    pool: &PgPool,
    project_id: Uuid,
) -> DbResult<Option<(Option<Uuid>, String)>> {
    let row: Option<(Option<Uuid>, String)> = sqlx::query_as(
        "SELECT tenant_id, slug FROM server.projects WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Upsert a repo by `(project_id, canonical_origin)`, reviving soft-deleted
/// rows, and return its id.
pub async fn ensure_repo(
    pool: &PgPool,
    project_id: Uuid,
    origin_url: &str,
    canonical_origin: &str,
    name: &str,
) -> DbResult<Uuid> {
    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO server.repos (project_id, origin_url, canonical_origin, name)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (project_id, canonical_origin)
        DO UPDATE SET origin_url = EXCLUDED.origin_url, deleted_at = NULL
        RETURNING id
        "#,
    )
    .bind(project_id)
    .bind(origin_url)
    .bind(canonical_origin)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// Canonical origin of a live repo within a project.
pub async fn repo_canonical_origin(
    pool: &PgPool,
    repo_id: Uuid,
    project_id: Uuid,
) -> DbResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT canonical_origin FROM server.repos
        WHERE id = $1 AND project_id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(repo_id)
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(o,)| o))
}

/// Projects a canonical origin is registered under (live repos in live
/// projects only), ordered by slug.
#[derive(Debug, sqlx::FromRow)]
pub struct RepoProject {
    pub repo_id: Uuid,
    pub canonical_origin: String,
    pub project_id: Uuid,
    pub project_slug: String,
}

pub async fn find_repo_projects(
    pool: &PgPool,
    canonical_origin: &str,
) -> DbResult<Vec<RepoProject>> {
    let rows = sqlx::query_as(
        r#"
        SELECT r.id AS repo_id, r.canonical_origin,
               p.id AS project_id, p.slug AS project_slug
        FROM server.repos r
        JOIN server.projects p ON r.project_id = p.id AND p.deleted_at IS NULL
        WHERE r.canonical_origin = $1 AND r.deleted_at IS NULL
        ORDER BY p.slug
        "#,
    )
    .bind(canonical_origin)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Workspace rows
// ---------------------------------------------------------------------------

/// Identity-critical columns, fetched without project scoping so callers can
/// distinguish "wrong project" from "does not exist".
#[derive(Debug, sqlx::FromRow)]
pub struct WorkspaceGate {
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub repo_id: Option<Uuid>,
    pub alias: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

pub async fn get_workspace_gate(
    pool: &PgPool,
    workspace_id: Uuid,
) -> DbResult<Option<WorkspaceGate>> {
    let row = sqlx::query_as(
        r#"
        SELECT workspace_id, project_id, repo_id, alias, deleted_at
        FROM server.workspaces
        WHERE workspace_id = $1
        "#,
    )
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Project-scoped summary used by workspace-alive gates.
#[derive(Debug, sqlx::FromRow)]
pub struct WorkspaceSummary {
    pub workspace_id: Uuid,
    pub alias: String,
    pub human_name: String,
    pub role: Option<String>,
    pub repo_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
}

pub async fn get_workspace_in_project(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
) -> DbResult<Option<WorkspaceSummary>> {
    let row = sqlx::query_as(
        r#"
        SELECT workspace_id, alias, human_name, role, repo_id, deleted_at
        FROM server.workspaces
        WHERE workspace_id = $1 AND project_id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// True when the workspace exists live in the project.
pub async fn workspace_exists_live(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
) -> DbResult<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1 FROM server.workspaces
        WHERE workspace_id = $1 AND project_id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(workspace_id)
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// Upsert + lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UpsertWorkspace {
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub repo_id: Uuid,
    pub alias: String,
    pub human_name: String,
    pub role: Option<String>,
    pub hostname: Option<String>,
    pub workspace_path: Option<String>,
}

/// Insert or refresh a workspace. The identity triple never changes here:
/// the conflict arm only touches mutable fields, and hostname/workspace_path
/// are set-once (COALESCE keeps the stored value).
pub async fn upsert_workspace(pool: &PgPool, ws: &UpsertWorkspace) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO server.workspaces
            (workspace_id, project_id, repo_id, alias, human_name, role,
             hostname, workspace_path, last_seen_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        ON CONFLICT (workspace_id) DO UPDATE SET
            human_name = EXCLUDED.human_name,
            role = COALESCE(EXCLUDED.role, server.workspaces.role),
            hostname = COALESCE(server.workspaces.hostname, EXCLUDED.hostname),
            workspace_path = COALESCE(server.workspaces.workspace_path, EXCLUDED.workspace_path),
            last_seen_at = NOW(),
            updated_at = NOW()
        "#,
    )
    .bind(ws.workspace_id)
    .bind(ws.project_id)
    .bind(ws.repo_id)
    .bind(&ws.alias)
    .bind(&ws.human_name)
    .bind(&ws.role)
    .bind(&ws.hostname)
    .bind(&ws.workspace_path)
    .execute(pool)
    .await?;
    Ok(())
}

/// Refresh activity tracking outside the heartbeat path (bdh commands).
pub async fn touch_workspace_last_seen(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
    human_name: &str,
    role: Option<&str>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE server.workspaces
        SET last_seen_at = NOW(), human_name = $3, role = COALESCE($4, role)
        WHERE workspace_id = $1 AND project_id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(workspace_id)
    .bind(project_id)
    .bind(human_name)
    .bind(role)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_current_branch(
    pool: &PgPool,
    workspace_id: Uuid,
    branch: &str,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE server.workspaces
        SET current_branch = $2, last_seen_at = NOW()
        WHERE workspace_id = $1
        "#,
    )
    .bind(workspace_id)
    .bind(branch)
    .execute(pool)
    .await?;
    Ok(())
}

/// Outcome of a soft delete.
#[derive(Debug)]
pub enum SoftDeleteOutcome {
    Deleted {
        alias: String,
        deleted_at: DateTime<Utc>,
    },
    AlreadyDeleted,
    NotFound,
}

/// Soft-delete a workspace and release all of its bead claims. The FK
/// cascade only fires on hard deletes, so the claim sweep is explicit, and
/// both writes commit together.
pub async fn soft_delete_workspace(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
) -> DbResult<SoftDeleteOutcome> {
    let mut tx = pool.begin().await.map_err(DbError::from)?;

    let existing: Option<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
        r#"
        SELECT alias, deleted_at FROM server.workspaces
        WHERE workspace_id = $1 AND project_id = $2
        FOR UPDATE
        "#,
    )
    .bind(workspace_id)
    .bind(project_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((alias, deleted_at)) = existing else {
        return Ok(SoftDeleteOutcome::NotFound);
    };
    if deleted_at.is_some() {
        return Ok(SoftDeleteOutcome::AlreadyDeleted);
    }

    let now = Utc::now();
    sqlx::query("UPDATE server.workspaces SET deleted_at = $2 WHERE workspace_id = $1")
        .bind(workspace_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM server.bead_claims WHERE workspace_id = $1")
        .bind(workspace_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await.map_err(DbError::from)?;
    Ok(SoftDeleteOutcome::Deleted {
        alias,
        deleted_at: now,
    })
}

/// Outcome of a restore attempt.
#[derive(Debug)]
pub enum RestoreOutcome {
    Restored {
        alias: String,
        restored_at: DateTime<Utc>,
    },
    NotDeleted,
    AliasTaken {
        alias: String,
    },
    NotFound,
}

/// Clear `deleted_at` if the alias is still free among live workspaces.
/// Claims are not resurrected; they were dropped at delete time.
pub async fn restore_workspace(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
) -> DbResult<RestoreOutcome> {
    let mut tx = pool.begin().await.map_err(DbError::from)?;

    let existing: Option<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
        r#"
        SELECT alias, deleted_at FROM server.workspaces
        WHERE workspace_id = $1 AND project_id = $2
        FOR UPDATE
        "#,
    )
    .bind(workspace_id)
    .bind(project_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((alias, deleted_at)) = existing else {
        return Ok(RestoreOutcome::NotFound);
    };
    if deleted_at.is_none() {
        return Ok(RestoreOutcome::NotDeleted);
    }

    let conflict: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT workspace_id FROM server.workspaces
        WHERE project_id = $1 AND alias = $2 AND workspace_id != $3 AND deleted_at IS NULL
        "#,
    )
    .bind(project_id)
    .bind(&alias)
    .bind(workspace_id)
    .fetch_optional(&mut *tx)
    .await?;
    if conflict.is_some() {
        return Ok(RestoreOutcome::AliasTaken { alias });
    }

    let now = Utc::now();
    sqlx::query(
        "UPDATE server.workspaces SET deleted_at = NULL, updated_at = $2 WHERE workspace_id = $1",
    )
    .bind(workspace_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await.map_err(DbError::from)?;
    Ok(RestoreOutcome::Restored {
        alias,
        restored_at: now,
    })
}

/// SQL-side alias collision probe: live workspaces first, then claim rows
/// (which cover the window before a workspace is persisted). The Redis alias
/// index is the third leg, consulted by the caller.
pub async fn alias_collision(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
    alias: &str,
) -> DbResult<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT workspace_id FROM server.workspaces
        WHERE project_id = $1 AND alias = $2 AND workspace_id != $3 AND deleted_at IS NULL
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .bind(alias)
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;
    if let Some((holder,)) = row {
        return Ok(Some(holder));
    }

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT workspace_id FROM server.bead_claims
        WHERE project_id = $1 AND alias = $2 AND workspace_id != $3
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .bind(alias)
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(holder,)| holder))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Immutability violations surfaced by [`register_workspace`].
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterConflict {
    OtherProject,
    OtherRepo,
    OtherAlias,
    AliasTaken,
}

#[derive(Debug)]
pub struct RegisterResult {
    pub repo_id: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct RegisterArgs {
    pub project_id: Uuid,
    pub project_slug: String,
    pub project_name: Option<String>,
    pub workspace_id: Uuid,
    pub alias: String,
    pub human_name: String,
    pub origin_url: String,
    pub canonical_origin: String,
    pub repo_name: String,
    pub role: Option<String>,
    pub hostname: Option<String>,
    pub workspace_path: Option<String>,
}

/// Register (or revive) a workspace for an authenticated agent, creating the
/// project mirror and repo rows as needed — all inside one transaction so a
/// conflict leaves no partial state.
pub async fn register_workspace(
    pool: &PgPool,
    args: &RegisterArgs,
) -> DbResult<Result<RegisterResult, RegisterConflict>> {
    let mut tx = pool.begin().await.map_err(DbError::from)?;

    sqlx::query(
        r#"
        INSERT INTO server.projects (id, tenant_id, slug, name, deleted_at)
        VALUES ($1, NULL, $2, $3, NULL)
        ON CONFLICT (id)
        DO UPDATE SET slug = EXCLUDED.slug, name = EXCLUDED.name, deleted_at = NULL
        "#,
    )
    .bind(args.project_id)
    .bind(&args.project_slug)
    .bind(&args.project_name)
    .execute(&mut *tx)
    .await?;

    let repo: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO server.repos (project_id, origin_url, canonical_origin, name)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (project_id, canonical_origin)
        DO UPDATE SET origin_url = EXCLUDED.origin_url, deleted_at = NULL
        RETURNING id
        "#,
    )
    .bind(args.project_id)
    .bind(&args.origin_url)
    .bind(&args.canonical_origin)
    .bind(&args.repo_name)
    .fetch_one(&mut *tx)
    .await?;
    let repo_id = repo.0;

    let existing: Option<(Uuid, Option<Uuid>, String)> = sqlx::query_as(
        r#"
        SELECT project_id, repo_id, alias
        FROM server.workspaces
        WHERE workspace_id = $1
        "#,
    )
    .bind(args.workspace_id)
    .fetch_optional(&mut *tx)
    .await?;

    let created = match existing {
        Some((existing_project, existing_repo, existing_alias)) => {
            if existing_project != args.project_id {
                return Ok(Err(RegisterConflict::OtherProject));
            }
            if let Some(existing_repo) = existing_repo {
                if existing_repo != repo_id {
                    return Ok(Err(RegisterConflict::OtherRepo));
                }
            }
            if existing_alias != args.alias {
                return Ok(Err(RegisterConflict::OtherAlias));
            }

            sqlx::query(
                r#"
                UPDATE server.workspaces
                SET deleted_at = NULL,
                    hostname = $2,
                    workspace_path = $3,
                    role = $4,
                    human_name = $5,
                    updated_at = NOW()
                WHERE workspace_id = $1
                "#,
            )
            .bind(args.workspace_id)
            .bind(&args.hostname)
            .bind(&args.workspace_path)
            .bind(&args.role)
            .bind(&args.human_name)
            .execute(&mut *tx)
            .await?;
            false
        }
        None => {
            let insert = sqlx::query(
                r#"
                INSERT INTO server.workspaces
                    (workspace_id, project_id, repo_id, alias, human_name, role,
                     hostname, workspace_path, workspace_type)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'agent')
                "#,
            )
            .bind(args.workspace_id)
            .bind(args.project_id)
            .bind(repo_id)
            .bind(&args.alias)
            .bind(&args.human_name)
            .bind(&args.role)
            .bind(&args.hostname)
            .bind(&args.workspace_path)
            .execute(&mut *tx)
            .await;

            match insert {
                Ok(_) => true,
                Err(err) => {
                    let err = DbError::from(err);
                    if err.is_unique_violation() {
                        return Ok(Err(RegisterConflict::AliasTaken));
                    }
                    return Err(err);
                }
            }
        }
    };

    tx.commit().await.map_err(DbError::from)?;
    Ok(Ok(RegisterResult { repo_id, created }))
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// One row of the workspace listing, with focus-apex enrichment joined in.
#[derive(Debug, sqlx::FromRow)]
pub struct WorkspaceRow {
    pub workspace_id: Uuid,
    pub alias: String,
    pub human_name: String,
    pub current_branch: Option<String>,
    pub project_id: Uuid,
    pub role: Option<String>,
    pub hostname: Option<String>,
    pub workspace_path: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub focus_apex_bead_id: Option<String>,
    pub focus_apex_repo_name: Option<String>,
    pub focus_apex_branch: Option<String>,
    pub focus_updated_at: Option<DateTime<Utc>>,
    pub focus_apex_title: Option<String>,
    pub focus_apex_type: Option<String>,
    pub project_slug: String,
    pub repo: Option<String>,
    pub claim_count: i64,
    pub last_claimed_at: Option<DateTime<Utc>>,
}

const WORKSPACE_SELECT_COLUMNS: &str = r#"
            w.workspace_id,
            w.alias,
            w.human_name,
            w.current_branch,
            w.project_id,
            w.role,
            w.hostname,
            w.workspace_path,
            w.last_seen_at,
            w.updated_at,
            w.deleted_at,
            w.focus_apex_bead_id,
            w.focus_apex_repo_name,
            w.focus_apex_branch,
            w.focus_updated_at,
            focus_issue.title AS focus_apex_title,
            focus_issue.issue_type AS focus_apex_type,
            p.slug AS project_slug,
            r.canonical_origin AS repo
"#;

const FOCUS_ISSUE_LATERAL: &str = r#"
        LEFT JOIN LATERAL (
            SELECT title, issue_type
            FROM beads.beads_issues
            WHERE w.focus_apex_bead_id IS NOT NULL
              AND project_id = w.project_id
              AND bead_id = w.focus_apex_bead_id
              AND repo = w.focus_apex_repo_name
              AND branch = w.focus_apex_branch
            ORDER BY synced_at DESC
            LIMIT 1
        ) focus_issue ON true
"#;

/// Filters for the paginated workspace listing.
#[derive(Debug, Default, Clone)]
pub struct WorkspaceFilter {
    pub human_name: Option<String>,
    pub repo: Option<String>,
    pub alias: Option<String>,
    pub hostname: Option<String>,
    pub include_deleted: bool,
    pub updated_before: Option<DateTime<Utc>>,
}

/// Cursor-paginated listing ordered by `updated_at DESC`. Fetches one row
/// beyond `limit` so the caller can detect `has_more`.
pub async fn list_workspaces(
    pool: &PgPool,
    project_id: Uuid,
    filter: &WorkspaceFilter,
    limit: i64,
) -> DbResult<Vec<WorkspaceRow>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
    qb.push(WORKSPACE_SELECT_COLUMNS);
    qb.push(", 0::bigint AS claim_count, NULL::timestamptz AS last_claimed_at");
    qb.push(
        r#"
        FROM server.workspaces w
        JOIN server.projects p ON w.project_id = p.id AND p.deleted_at IS NULL
        LEFT JOIN server.repos r ON w.repo_id = r.id AND r.deleted_at IS NULL
        "#,
    );
    qb.push(FOCUS_ISSUE_LATERAL);
    qb.push(" WHERE w.project_id = ");
    qb.push_bind(project_id);

    if let Some(human_name) = &filter.human_name {
        qb.push(" AND w.human_name = ");
        qb.push_bind(human_name.clone());
    }
    if let Some(repo) = &filter.repo {
        qb.push(" AND r.canonical_origin = ");
        qb.push_bind(repo.clone());
    }
    if let Some(alias) = &filter.alias {
        qb.push(" AND w.alias = ");
        qb.push_bind(alias.clone());
    }
    if let Some(hostname) = &filter.hostname {
        qb.push(" AND w.hostname = ");
        qb.push_bind(hostname.clone());
    }
    if !filter.include_deleted {
        qb.push(" AND w.deleted_at IS NULL");
    }
    if let Some(before) = filter.updated_before {
        qb.push(" AND w.updated_at < ");
        qb.push_bind(before);
    }

    qb.push(" ORDER BY w.updated_at DESC LIMIT ");
    qb.push_bind(limit + 1);

    let rows = qb.build_query_as::<WorkspaceRow>().fetch_all(pool).await?;
    Ok(rows)
}

/// Bounded team-status candidates: claim-holding workspaces first, then by
/// recency. The caller applies presence enrichment and the final in-process
/// sort/truncation.
pub async fn team_workspace_candidates(
    pool: &PgPool,
    project_id: Uuid,
    human_name: Option<&str>,
    repo: Option<&str>,
    only_with_claims: bool,
    candidate_limit: i64,
) -> DbResult<Vec<WorkspaceRow>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        WITH claim_stats AS (
            SELECT workspace_id,
                   COUNT(*) AS claim_count,
                   MAX(claimed_at) AS last_claimed_at
            FROM server.bead_claims
            WHERE project_id =
        "#,
    );
    qb.push_bind(project_id);
    qb.push(" GROUP BY workspace_id ) SELECT ");
    qb.push(WORKSPACE_SELECT_COLUMNS);
    qb.push(", COALESCE(cs.claim_count, 0) AS claim_count, cs.last_claimed_at");
    qb.push(
        r#"
        FROM server.workspaces w
        JOIN server.projects p ON w.project_id = p.id AND p.deleted_at IS NULL
        LEFT JOIN server.repos r ON w.repo_id = r.id AND r.deleted_at IS NULL
        LEFT JOIN claim_stats cs ON cs.workspace_id = w.workspace_id
        "#,
    );
    qb.push(FOCUS_ISSUE_LATERAL);
    qb.push(" WHERE w.project_id = ");
    qb.push_bind(project_id);
    qb.push(" AND w.deleted_at IS NULL");

    if let Some(human_name) = human_name {
        qb.push(" AND w.human_name = ");
        qb.push_bind(human_name.to_string());
    }
    if let Some(repo) = repo {
        qb.push(" AND r.canonical_origin = ");
        qb.push_bind(repo.to_string());
    }
    if only_with_claims {
        qb.push(" AND COALESCE(cs.claim_count, 0) > 0");
    }

    qb.push(
        r#"
        ORDER BY
            (COALESCE(cs.claim_count, 0) > 0) DESC,
            w.last_seen_at DESC NULLS LAST,
            cs.last_claimed_at DESC NULLS LAST,
            w.alias ASC
        LIMIT
        "#,
    );
    qb.push_bind(candidate_limit);

    let rows = qb.build_query_as::<WorkspaceRow>().fetch_all(pool).await?;
    Ok(rows)
}

/// Fetch one live workspace row (team-view shape), scoped to the project.
pub async fn team_workspace_by_id(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
) -> DbResult<Option<WorkspaceRow>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
    qb.push(WORKSPACE_SELECT_COLUMNS);
    qb.push(
        r#"
        , COALESCE(cs.claim_count, 0) AS claim_count, cs.last_claimed_at
        FROM server.workspaces w
        JOIN server.projects p ON w.project_id = p.id AND p.deleted_at IS NULL
        LEFT JOIN server.repos r ON w.repo_id = r.id AND r.deleted_at IS NULL
        LEFT JOIN (
            SELECT workspace_id,
                   COUNT(*) AS claim_count,
                   MAX(claimed_at) AS last_claimed_at
            FROM server.bead_claims
            GROUP BY workspace_id
        ) cs ON cs.workspace_id = w.workspace_id
        "#,
    );
    qb.push(FOCUS_ISSUE_LATERAL);
    qb.push(" WHERE w.workspace_id = ");
    qb.push_bind(workspace_id);
    qb.push(" AND w.project_id = ");
    qb.push_bind(project_id);
    qb.push(" AND w.deleted_at IS NULL");

    let row = qb
        .build_query_as::<WorkspaceRow>()
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Workspace-id lookups (status + SSE scoping)
// ---------------------------------------------------------------------------

pub async fn all_workspace_ids(
    pool: &PgPool,
    project_id: Uuid,
    limit: i64,
) -> DbResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT workspace_id FROM server.workspaces
        WHERE project_id = $1 AND deleted_at IS NULL
        ORDER BY updated_at DESC
        LIMIT $2
        "#,
    )
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn workspace_ids_by_repo_origin(
    pool: &PgPool,
    project_id: Uuid,
    canonical_origin: &str,
    limit: i64,
) -> DbResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT w.workspace_id
        FROM server.workspaces w
        JOIN server.repos r ON w.repo_id = r.id
        WHERE r.canonical_origin = $1 AND w.project_id = $2
          AND w.deleted_at IS NULL AND r.deleted_at IS NULL
        ORDER BY w.updated_at DESC
        LIMIT $3
        "#,
    )
    .bind(canonical_origin)
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn workspace_ids_by_repo_id(
    pool: &PgPool,
    project_id: Uuid,
    repo_id: Uuid,
    limit: i64,
) -> DbResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT workspace_id FROM server.workspaces
        WHERE repo_id = $1 AND project_id = $2 AND deleted_at IS NULL
        ORDER BY updated_at DESC
        LIMIT $3
        "#,
    )
    .bind(repo_id)
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn workspace_ids_by_human_name(
    pool: &PgPool,
    project_id: Uuid,
    human_name: &str,
    limit: i64,
) -> DbResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT workspace_id FROM server.workspaces
        WHERE human_name = $1 AND project_id = $2 AND deleted_at IS NULL
        ORDER BY updated_at DESC
        LIMIT $3
        "#,
    )
    .bind(human_name)
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
