//! Identity store: bearer tokens, agents, projects.
//!
//! Bearer tokens look like `aw_sk_<opaque>`. The key row is located by the
//! first characters of the opaque part and the full token is verified by
//! comparing SHA-256 digests in constant time. Nothing here ever stores or
//! logs the raw token.

use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::DbResult;

/// Bearer token prefix on the wire.
pub const TOKEN_SCHEME: &str = "aw_sk_";

/// Length of the random opaque part.
const TOKEN_OPAQUE_LEN: usize = 43;

/// Characters of the opaque part used for the indexed lookup.
const TOKEN_LOOKUP_PREFIX_LEN: usize = 12;

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Identity facts resolved from a valid bearer token.
#[derive(Debug, Clone)]
pub struct TokenDetails {
    pub project_id: Uuid,
    pub agent_id: Uuid,
    pub api_key_id: Uuid,
}

/// Full agent profile, used where alias/human context is needed.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub project_id: Uuid,
    pub project_slug: String,
    pub project_name: String,
    pub agent_id: Uuid,
    pub alias: String,
    pub human_name: String,
    pub did: Option<String>,
    pub custody: Option<String>,
    pub lifetime: String,
    pub status: String,
}

/// A freshly minted API key. The raw token exists only in this value and the
/// response that carries it to the caller.
#[derive(Debug)]
pub struct MintedKey {
    pub token: String,
    pub key_prefix: String,
    pub key_hash: String,
}

/// Generate a new bearer token plus its stored prefix and digest.
pub fn mint_api_key() -> MintedKey {
    let mut rng = rand::thread_rng();
    let opaque: String = (0..TOKEN_OPAQUE_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect();
    let token = format!("{TOKEN_SCHEME}{opaque}");
    MintedKey {
        key_prefix: opaque[..TOKEN_LOOKUP_PREFIX_LEN].to_string(),
        key_hash: hash_token(&token),
        token,
    }
}

/// Hex SHA-256 digest of the full token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn digests_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(sqlx::FromRow)]
struct KeyCandidate {
    key_id: Uuid,
    project_id: Uuid,
    agent_id: Uuid,
    key_hash: String,
}

/// Resolve a bearer token to its identity, or `None` for any invalid,
/// revoked, or dangling token. The agent and its project must both be live
/// and the agent must not be deregistered.
pub async fn verify_bearer_token(pool: &PgPool, token: &str) -> DbResult<Option<TokenDetails>> {
    let Some(opaque) = token.strip_prefix(TOKEN_SCHEME) else {
        return Ok(None);
    };
    if opaque.len() < TOKEN_LOOKUP_PREFIX_LEN {
        return Ok(None);
    }
    let prefix = &opaque[..TOKEN_LOOKUP_PREFIX_LEN];

    let candidates: Vec<KeyCandidate> = sqlx::query_as(
        r#"
        SELECT k.key_id, k.project_id, k.agent_id, k.key_hash
        FROM aweb.api_keys k
        JOIN aweb.agents a ON a.agent_id = k.agent_id
            AND a.deleted_at IS NULL
            AND a.status != 'deregistered'
        JOIN aweb.projects p ON p.project_id = k.project_id
            AND p.deleted_at IS NULL
        WHERE k.key_prefix = $1 AND k.is_active
        "#,
    )
    .bind(prefix)
    .fetch_all(pool)
    .await?;

    let supplied = hash_token(token);
    for candidate in candidates {
        if digests_match(&candidate.key_hash, &supplied) {
            return Ok(Some(TokenDetails {
                project_id: candidate.project_id,
                agent_id: candidate.agent_id,
                api_key_id: candidate.key_id,
            }));
        }
    }
    Ok(None)
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    project_id: Uuid,
    slug: String,
    name: Option<String>,
    agent_id: Uuid,
    alias: String,
    human_name: String,
    did: Option<String>,
    custody: Option<String>,
    lifetime: String,
    status: String,
}

/// Load the full profile for an agent within its project. `None` when either
/// side is missing or soft-deleted.
pub async fn load_agent_profile(
    pool: &PgPool,
    project_id: Uuid,
    agent_id: Uuid,
) -> DbResult<Option<AgentProfile>> {
    let row: Option<ProfileRow> = sqlx::query_as(
        r#"
        SELECT p.project_id, p.slug, p.name,
               a.agent_id, a.alias, a.human_name, a.did, a.custody, a.lifetime, a.status
        FROM aweb.agents a
        JOIN aweb.projects p ON p.project_id = a.project_id AND p.deleted_at IS NULL
        WHERE a.agent_id = $1 AND a.project_id = $2 AND a.deleted_at IS NULL
        "#,
    )
    .bind(agent_id)
    .bind(project_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| AgentProfile {
        project_id: r.project_id,
        project_slug: r.slug,
        project_name: r.name.unwrap_or_default(),
        agent_id: r.agent_id,
        alias: r.alias,
        human_name: r.human_name,
        did: r.did,
        custody: r.custody,
        lifetime: r.lifetime,
        status: r.status,
    }))
}

/// Listing row for `GET /v1/agents`.
#[derive(Debug, sqlx::FromRow)]
pub struct AgentListing {
    pub agent_id: Uuid,
    pub alias: String,
    pub human_name: String,
    pub agent_type: String,
    pub did: Option<String>,
    pub custody: Option<String>,
    pub lifetime: String,
    pub status: String,
    pub access_mode: String,
}

pub async fn list_agents(pool: &PgPool, project_id: Uuid) -> DbResult<Vec<AgentListing>> {
    let rows = sqlx::query_as(
        r#"
        SELECT agent_id, alias, human_name, agent_type,
               did, custody, lifetime, status, access_mode
        FROM aweb.agents
        WHERE project_id = $1 AND deleted_at IS NULL
        ORDER BY alias ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Aliases currently held in the project (live agents only), used by the
/// classic-name allocator.
pub async fn list_agent_aliases(pool: &PgPool, project_id: Uuid) -> DbResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT alias FROM aweb.agents
        WHERE project_id = $1 AND deleted_at IS NULL
        ORDER BY alias
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(a,)| a).collect())
}

/// Mark an agent deregistered. Its keys stop validating immediately (the
/// token check joins on agent status). Returns false when the agent was not
/// found live in the project.
pub async fn deregister_agent(pool: &PgPool, project_id: Uuid, agent_id: Uuid) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE aweb.agents
        SET status = 'deregistered'
        WHERE agent_id = $1 AND project_id = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(agent_id)
    .bind(project_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Look up a project by slug in the identity schema.
pub async fn find_project_by_slug(
    pool: &PgPool,
    slug: &str,
) -> DbResult<Option<(Uuid, String)>> {
    let row: Option<(Uuid, String)> = sqlx::query_as(
        r#"
        SELECT project_id, slug FROM aweb.projects
        WHERE slug = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_keys_have_expected_shape() {
        let key = mint_api_key();
        assert!(key.token.starts_with(TOKEN_SCHEME));
        assert_eq!(key.token.len(), TOKEN_SCHEME.len() + TOKEN_OPAQUE_LEN);
        assert_eq!(key.key_prefix.len(), TOKEN_LOOKUP_PREFIX_LEN);
        assert_eq!(key.key_hash, hash_token(&key.token));
        assert_eq!(key.key_hash.len(), 64);
    }

    #[test]
    fn minted_keys_are_unique() {
        let a = mint_api_key();
        let b = mint_api_key();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn digest_comparison() {
        let h = hash_token("aw_sk_example");
        assert!(digests_match(&h, &hash_token("aw_sk_example")));
        assert!(!digests_match(&h, &hash_token("aw_sk_other")));
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
    }
}
