//! Redis-backed presence: the volatile "who is live right now" cache.
//!
//! One hash per workspace (`presence:<workspace_id>`) with a TTL, plus
//! secondary set indices so lookups by project, slug, repo, branch and alias
//! never SCAN. Index entries may outlive the presence hash (their TTL is
//! doubled); readers detect that with pipelined `EXISTS` checks and lazily
//! remove stale members.
//!
//! Presence is a cache of SQL. Nothing here is authoritative: a missing or
//! stale record only means "not recently seen", and every write path in the
//! server treats Redis failures as warnings, not request failures.

use std::collections::HashMap;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use bh_core::validate::{is_valid_role, normalize_role, ROLE_MAX_LENGTH};

/// Default presence TTL: 30 minutes.
pub const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 1800;

// ---------------------------------------------------------------------------
// Key construction
// ---------------------------------------------------------------------------

/// Percent-encode a value for safe use inside a colon-delimited Redis key.
///
/// Without this, a value containing `:` could make two different key tuples
/// collide:
///   project="abc",  alias="xyz:def" -> idx:alias:abc:xyz:def
///   project="abc:xyz", alias="def"  -> idx:alias:abc:xyz:def
fn safe_key_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn presence_key(workspace_id: &str) -> String {
    format!("presence:{workspace_id}")
}

fn all_workspaces_index_key() -> String {
    "idx:all_workspaces".to_string()
}

fn project_workspaces_index_key(project_id: &str) -> String {
    format!("idx:project_workspaces:{project_id}")
}

fn project_slug_workspaces_index_key(project_slug: &str) -> String {
    format!(
        "idx:project_slug_workspaces:{}",
        safe_key_component(project_slug)
    )
}

fn repo_workspaces_index_key(repo_id: &str) -> String {
    format!("idx:repo_workspaces:{repo_id}")
}

fn branch_workspaces_index_key(repo_id: &str, branch: &str) -> String {
    format!(
        "idx:branch_workspaces:{repo_id}:{}",
        safe_key_component(branch)
    )
}

/// Single-valued key mapping `(project, alias)` to the workspace holding it.
fn alias_index_key(project_id: &str, alias: &str) -> String {
    format!("idx:alias:{project_id}:{}", safe_key_component(alias))
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

/// One presence refresh. Optional fields follow the preservation contract:
/// `role`, `canonical_origin` and `timezone` are only written when present so
/// a sparse heartbeat never erases them.
#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
    pub workspace_id: String,
    pub alias: String,
    pub human_name: Option<String>,
    pub project_id: Option<String>,
    pub project_slug: Option<String>,
    pub repo_id: Option<String>,
    pub member_email: String,
    pub program: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
    pub current_branch: Option<String>,
    pub role: Option<String>,
    pub canonical_origin: Option<String>,
    pub timezone: Option<String>,
    pub ttl_seconds: Option<u64>,
}

/// Upsert a workspace's presence hash and refresh every applicable index.
/// Returns the ISO timestamp stored as `last_seen`.
pub async fn update_agent_presence(
    conn: &mut ConnectionManager,
    update: &PresenceUpdate,
) -> redis::RedisResult<String> {
    let ttl = update.ttl_seconds.unwrap_or(DEFAULT_PRESENCE_TTL_SECONDS) as i64;
    let now = Utc::now().to_rfc3339();
    let key = presence_key(&update.workspace_id);

    let mut fields: Vec<(&str, String)> = vec![
        ("workspace_id", update.workspace_id.clone()),
        ("alias", update.alias.clone()),
        ("human_name", update.human_name.clone().unwrap_or_default()),
        ("project_id", update.project_id.clone().unwrap_or_default()),
        (
            "project_slug",
            update.project_slug.clone().unwrap_or_default(),
        ),
        ("repo_id", update.repo_id.clone().unwrap_or_default()),
        ("member_email", update.member_email.clone()),
        ("program", update.program.clone().unwrap_or_default()),
        ("model", update.model.clone().unwrap_or_default()),
        (
            "status",
            update.status.clone().unwrap_or_else(|| "active".into()),
        ),
        (
            "current_branch",
            update.current_branch.clone().unwrap_or_default(),
        ),
        ("last_seen", now.clone()),
    ];
    if let Some(origin) = &update.canonical_origin {
        fields.push(("canonical_origin", origin.clone()));
    }
    if let Some(role) = &update.role {
        if role.chars().count() <= ROLE_MAX_LENGTH && is_valid_role(role) {
            fields.push(("role", normalize_role(role)));
        }
    }
    if let Some(tz) = &update.timezone {
        fields.push(("timezone", tz.clone()));
    }

    let mut pipe = redis::pipe();
    pipe.hset_multiple(&key, &fields).ignore();
    pipe.expire(&key, ttl).ignore();

    // Index TTLs are 2x the presence TTL so entries outlive their hashes and
    // lazy cleanup can detect staleness with EXISTS.
    let all_idx = all_workspaces_index_key();
    pipe.sadd(&all_idx, &update.workspace_id).ignore();
    pipe.expire(&all_idx, ttl * 2).ignore();

    if let Some(project_id) = update.project_id.as_deref().filter(|p| !p.is_empty()) {
        let idx = project_workspaces_index_key(project_id);
        pipe.sadd(&idx, &update.workspace_id).ignore();
        pipe.expire(&idx, ttl * 2).ignore();

        let alias_idx = alias_index_key(project_id, &update.alias);
        pipe.set_ex(&alias_idx, &update.workspace_id, (ttl * 2) as u64)
            .ignore();
    }

    if let Some(slug) = update.project_slug.as_deref().filter(|s| !s.is_empty()) {
        let idx = project_slug_workspaces_index_key(slug);
        pipe.sadd(&idx, &update.workspace_id).ignore();
        pipe.expire(&idx, ttl * 2).ignore();
    }

    if let Some(repo_id) = update.repo_id.as_deref().filter(|r| !r.is_empty()) {
        let idx = repo_workspaces_index_key(repo_id);
        pipe.sadd(&idx, &update.workspace_id).ignore();
        pipe.expire(&idx, ttl * 2).ignore();

        if let Some(branch) = update.current_branch.as_deref().filter(|b| !b.is_empty()) {
            let idx = branch_workspaces_index_key(repo_id, branch);
            pipe.sadd(&idx, &update.workspace_id).ignore();
            pipe.expire(&idx, ttl * 2).ignore();
        }
    }

    pipe.query_async::<()>(conn).await?;
    Ok(now)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Fetch one workspace's presence hash, `None` when expired or never seen.
pub async fn get_agent_presence(
    conn: &mut ConnectionManager,
    workspace_id: &str,
) -> redis::RedisResult<Option<HashMap<String, String>>> {
    let data: HashMap<String, String> = conn.hgetall(presence_key(workspace_id)).await?;
    Ok(if data.is_empty() { None } else { Some(data) })
}

/// Batched presence fetch for known workspace ids; one pipeline round-trip.
/// Missing entries are skipped, not reported.
pub async fn list_agent_presences_by_workspace_ids(
    conn: &mut ConnectionManager,
    workspace_ids: &[String],
) -> redis::RedisResult<Vec<HashMap<String, String>>> {
    if workspace_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut pipe = redis::pipe();
    for ws_id in workspace_ids {
        pipe.hgetall(presence_key(ws_id));
    }
    let results: Vec<HashMap<String, String>> = pipe.query_async(conn).await?;
    Ok(results.into_iter().filter(|m| !m.is_empty()).collect())
}

/// All live presences, via the global index.
pub async fn list_agent_presences(
    conn: &mut ConnectionManager,
) -> redis::RedisResult<Vec<HashMap<String, String>>> {
    let ids = filter_valid_workspace_ids(conn, &all_workspaces_index_key()).await?;
    list_agent_presences_by_workspace_ids(conn, &ids).await
}

/// Read one index set, drop members whose presence hash has expired, and
/// lazily remove those stale members from the index.
///
/// There is a benign race: a workspace removed here just as it refreshes gets
/// re-added on its next presence update.
async fn filter_valid_workspace_ids(
    conn: &mut ConnectionManager,
    idx_key: &str,
) -> redis::RedisResult<Vec<String>> {
    let members: Vec<String> = conn.smembers(idx_key).await?;
    if members.is_empty() {
        return Ok(Vec::new());
    }

    let mut pipe = redis::pipe();
    for ws_id in &members {
        pipe.exists(presence_key(ws_id));
    }
    let exists: Vec<bool> = pipe.query_async(conn).await?;

    let mut valid = Vec::new();
    let mut stale = Vec::new();
    for (ws_id, ok) in members.into_iter().zip(exists) {
        if ok {
            valid.push(ws_id);
        } else {
            stale.push(ws_id);
        }
    }

    if !stale.is_empty() {
        debug!(index = idx_key, stale = stale.len(), "pruning stale presence index entries");
        let mut cleanup = redis::pipe();
        for ws_id in &stale {
            cleanup.srem(idx_key, ws_id).ignore();
        }
        cleanup.query_async::<()>(conn).await?;
    }

    Ok(valid)
}

/// Workspace ids live in a project, by project UUID.
pub async fn get_workspace_ids_by_project_id(
    conn: &mut ConnectionManager,
    project_id: &str,
) -> redis::RedisResult<Vec<String>> {
    filter_valid_workspace_ids(conn, &project_workspaces_index_key(project_id)).await
}

/// Workspace ids live in a project, by slug.
pub async fn get_workspace_ids_by_project_slug(
    conn: &mut ConnectionManager,
    project_slug: &str,
) -> redis::RedisResult<Vec<String>> {
    filter_valid_workspace_ids(conn, &project_slug_workspaces_index_key(project_slug)).await
}

/// Workspace ids live on a repo.
pub async fn get_workspace_ids_by_repo_id(
    conn: &mut ConnectionManager,
    repo_id: &str,
) -> redis::RedisResult<Vec<String>> {
    filter_valid_workspace_ids(conn, &repo_workspaces_index_key(repo_id)).await
}

/// Workspace ids live on a specific branch of a repo.
pub async fn get_workspace_ids_by_branch(
    conn: &mut ConnectionManager,
    repo_id: &str,
    branch: &str,
) -> redis::RedisResult<Vec<String>> {
    filter_valid_workspace_ids(conn, &branch_workspaces_index_key(repo_id, branch)).await
}

/// Every workspace id with live presence.
pub async fn get_all_workspace_ids(
    conn: &mut ConnectionManager,
) -> redis::RedisResult<Vec<String>> {
    filter_valid_workspace_ids(conn, &all_workspaces_index_key()).await
}

/// O(1) alias-collision probe. Returns the workspace currently holding the
/// alias within the project, verifying its presence hash is still live (and
/// cleaning the index entry up when it is not).
///
/// This is presence-level only; the workspaces table remains the
/// authoritative source of alias ownership.
pub async fn get_workspace_id_by_alias(
    conn: &mut ConnectionManager,
    project_id: &str,
    alias: &str,
) -> redis::RedisResult<Option<String>> {
    let idx_key = alias_index_key(project_id, alias);
    let holder: Option<String> = conn.get(&idx_key).await?;
    let Some(ws_id) = holder else {
        return Ok(None);
    };

    let live: bool = conn.exists(presence_key(&ws_id)).await?;
    if !live {
        let _: () = conn.del(&idx_key).await?;
        return Ok(None);
    }
    Ok(Some(ws_id))
}

/// Project slug recorded in a workspace's presence hash.
pub async fn get_workspace_project_slug(
    conn: &mut ConnectionManager,
    workspace_id: &str,
) -> redis::RedisResult<Option<String>> {
    let slug: Option<String> = conn
        .hget(presence_key(workspace_id), "project_slug")
        .await?;
    Ok(slug.filter(|s| !s.is_empty()))
}

/// Project UUID recorded in a workspace's presence hash.
pub async fn get_workspace_project_id(
    conn: &mut ConnectionManager,
    workspace_id: &str,
) -> redis::RedisResult<Option<String>> {
    let project_id: Option<String> = conn.hget(presence_key(workspace_id), "project_id").await?;
    Ok(project_id.filter(|s| !s.is_empty()))
}

// ---------------------------------------------------------------------------
// Clearing
// ---------------------------------------------------------------------------

/// Delete presence hashes for the given workspaces and drop them from the
/// global index. Secondary indices self-heal through lazy cleanup. Returns
/// the number of hashes actually deleted.
pub async fn clear_workspace_presence(
    conn: &mut ConnectionManager,
    workspace_ids: &[String],
) -> redis::RedisResult<usize> {
    if workspace_ids.is_empty() {
        return Ok(0);
    }

    let mut pipe = redis::pipe();
    for ws_id in workspace_ids {
        pipe.del(presence_key(ws_id));
    }
    let deleted: Vec<i64> = pipe.query_async(conn).await?;

    let all_idx = all_workspaces_index_key();
    let mut cleanup = redis::pipe();
    for ws_id in workspace_ids {
        cleanup.srem(&all_idx, ws_id).ignore();
    }
    cleanup.query_async::<()>(conn).await?;

    Ok(deleted.into_iter().filter(|n| *n > 0).count())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_components_are_escaped() {
        // A colon in user input must not create ambiguous key boundaries.
        assert_eq!(
            alias_index_key("abc", "xyz:def"),
            "idx:alias:abc:xyz%3Adef"
        );
        assert_eq!(
            branch_workspaces_index_key("r1", "feature/x"),
            "idx:branch_workspaces:r1:feature%2Fx"
        );
    }

    #[test]
    fn unreserved_chars_pass_through() {
        assert_eq!(safe_key_component("alice-01_x.y~z"), "alice-01_x.y~z");
        assert_eq!(safe_key_component("ümlaut"), "%C3%BCmlaut");
    }

    #[test]
    fn presence_keys() {
        assert_eq!(presence_key("w-1"), "presence:w-1");
        assert_eq!(
            project_slug_workspaces_index_key("my/slug"),
            "idx:project_slug_workspaces:my%2Fslug"
        );
    }
}
