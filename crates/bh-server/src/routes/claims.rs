//! Read-only claim listing.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use bh_core::pagination::{encode_cursor, validate_pagination_params};
use bh_core::validate::validate_workspace_id;
use bh_db::claims;

use crate::auth::get_project_from_auth;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct ClaimsQuery {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaimView {
    pub bead_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub human_name: String,
    pub claimed_at: String,
    pub project_id: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimsResponse {
    pub claims: Vec<ClaimView>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// List live claims, newest first, optionally for one workspace.
pub async fn list_claims(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ClaimsQuery>,
) -> ApiResult<Json<ClaimsResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;

    let (limit, cursor_data) =
        validate_pagination_params(query.limit, query.cursor.as_deref())
            .map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    let workspace_id = match &query.workspace_id {
        Some(raw) => {
            let validated = validate_workspace_id(raw).map_err(ApiError::Unprocessable)?;
            Some(
                Uuid::parse_str(&validated)
                    .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?,
            )
        }
        None => None,
    };

    let claimed_before = match cursor_data.as_ref().and_then(|c| c.get("claimed_at")) {
        Some(Value::String(ts)) => Some(
            DateTime::parse_from_rfc3339(ts)
                .map_err(|e| ApiError::Unprocessable(format!("Invalid cursor timestamp: {e}")))?
                .with_timezone(&Utc),
        ),
        Some(_) => {
            return Err(ApiError::Unprocessable(
                "Invalid cursor timestamp: not a string".into(),
            ))
        }
        None => None,
    };

    let mut rows = claims::list_claims(
        state.db.pool(),
        project_id,
        workspace_id,
        claimed_before,
        limit,
    )
    .await?;
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let claims: Vec<ClaimView> = rows
        .into_iter()
        .map(|row| ClaimView {
            bead_id: row.bead_id,
            workspace_id: row.workspace_id.to_string(),
            alias: row.alias,
            human_name: row.human_name,
            claimed_at: row.claimed_at.to_rfc3339(),
            project_id: row.project_id.to_string(),
        })
        .collect();

    let next_cursor = if has_more {
        claims.last().map(|last| {
            let mut fields = Map::new();
            fields.insert("claimed_at".into(), json!(last.claimed_at));
            encode_cursor(&fields)
        })
    } else {
        None
    };

    Ok(Json(ClaimsResponse {
        claims,
        has_more,
        next_cursor,
    }))
}
