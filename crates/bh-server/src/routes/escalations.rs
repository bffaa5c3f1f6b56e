//! Escalation endpoints: create, list, inspect, respond.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use bh_core::pagination::{encode_cursor, validate_pagination_params};
use bh_core::validate::{is_valid_alias, validate_workspace_id, INVALID_ALIAS_MESSAGE};
use bh_db::escalations::{self, CreateEscalation, EscalationFilter, VALID_ESCALATION_STATUSES};
use bh_db::registry;
use bh_events::{Event, EventKind};

use crate::auth::{enforce_actor_binding, get_identity_from_auth, get_project_from_auth};
use crate::error::{ApiError, ApiResult};
use crate::routes::bdh::publish_best_effort;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct CreateEscalationRequest {
    pub workspace_id: String,
    pub alias: String,
    pub subject: String,
    pub situation: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default = "default_expires_in_hours")]
    pub expires_in_hours: i64,
    #[serde(default)]
    pub member_email: Option<String>,
}

fn default_expires_in_hours() -> i64 {
    4
}

#[derive(Debug, Serialize)]
pub struct CreateEscalationResponse {
    pub escalation_id: String,
    pub status: String,
    pub created_at: String,
    pub expires_at: Option<String>,
}

/// Raise an escalation for a human and announce it on the workspace channel.
pub async fn create_escalation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<CreateEscalationRequest>,
) -> ApiResult<Json<CreateEscalationResponse>> {
    let identity = get_identity_from_auth(&state, &headers).await?;
    let workspace_id = validate_workspace_id(&payload.workspace_id)
        .map_err(ApiError::Unprocessable)?;
    let workspace_uuid = Uuid::parse_str(&workspace_id)
        .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;
    enforce_actor_binding(&identity, workspace_uuid)?;

    if !is_valid_alias(&payload.alias) {
        return Err(ApiError::Unprocessable(INVALID_ALIAS_MESSAGE.into()));
    }
    if payload.subject.trim().is_empty() || payload.situation.trim().is_empty() {
        return Err(ApiError::Unprocessable(
            "subject and situation are required".into(),
        ));
    }
    if payload.expires_in_hours <= 0 {
        return Err(ApiError::Unprocessable(
            "expires_in_hours must be positive".into(),
        ));
    }

    let workspace = registry::get_workspace_in_project(
        state.db.pool(),
        identity.project_id,
        workspace_uuid,
    )
    .await?
    .filter(|w| w.deleted_at.is_none())
    .ok_or_else(|| {
        ApiError::Forbidden("Workspace not found or does not belong to your project".into())
    })?;
    if workspace.alias != payload.alias {
        return Err(ApiError::Forbidden("Alias does not match workspace_id".into()));
    }

    let created = escalations::create_escalation(
        state.db.pool(),
        &CreateEscalation {
            project_id: identity.project_id,
            workspace_id: workspace_uuid,
            alias: payload.alias.clone(),
            member_email: payload.member_email.clone(),
            subject: payload.subject.clone(),
            situation: payload.situation.clone(),
            options: payload.options.as_ref().map(|o| json!(o)),
            expires_in_hours: payload.expires_in_hours,
        },
    )
    .await?;

    let mut conn = state.redis();
    let project_slug = bh_presence::get_workspace_project_slug(&mut conn, &workspace_id)
        .await
        .ok()
        .flatten();
    publish_best_effort(
        &state,
        Event::now(
            workspace_id,
            EventKind::EscalationCreated {
                escalation_id: created.id.to_string(),
                alias: payload.alias,
                subject: payload.subject,
            },
        )
        .with_project_slug(project_slug),
    )
    .await;

    Ok(Json(CreateEscalationResponse {
        escalation_id: created.id.to_string(),
        status: created.status,
        created_at: created.created_at.to_rfc3339(),
        expires_at: created.expires_at.map(|t| t.to_rfc3339()),
    }))
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListEscalationsQuery {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EscalationSummary {
    pub escalation_id: String,
    pub alias: String,
    pub subject: String,
    pub status: String,
    pub created_at: String,
    pub expires_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListEscalationsResponse {
    pub escalations: Vec<EscalationSummary>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

pub async fn list_escalations(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListEscalationsQuery>,
) -> ApiResult<Json<ListEscalationsResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;

    // Lazy expiry keeps the pending set honest without a background job.
    escalations::expire_overdue(state.db.pool(), project_id).await?;

    let (limit, cursor_data) =
        validate_pagination_params(query.limit, query.cursor.as_deref())
            .map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    let mut filter = EscalationFilter::default();

    if let Some(raw) = &query.workspace_id {
        let validated = validate_workspace_id(raw).map_err(ApiError::Unprocessable)?;
        let workspace_uuid = Uuid::parse_str(&validated)
            .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;
        if !registry::workspace_exists_live(state.db.pool(), project_id, workspace_uuid).await? {
            return Err(ApiError::Forbidden(
                "Workspace not found or does not belong to your project".into(),
            ));
        }
        filter.workspace_id = Some(workspace_uuid);
    } else if let Some(repo_id) = &query.repo_id {
        filter.repo_id = Some(
            Uuid::parse_str(repo_id)
                .map_err(|_| ApiError::Unprocessable("Invalid repo_id format: expected UUID".into()))?,
        );
    }

    if let Some(status) = &query.status {
        if !VALID_ESCALATION_STATUSES.contains(&status.as_str()) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid status: must be one of {}",
                VALID_ESCALATION_STATUSES.join(", ")
            )));
        }
        filter.status = Some(status.clone());
    }
    if let Some(alias) = &query.alias {
        if !is_valid_alias(alias) {
            return Err(ApiError::Unprocessable(INVALID_ALIAS_MESSAGE.into()));
        }
        filter.alias = Some(alias.clone());
    }

    filter.created_before = match cursor_data.as_ref().and_then(|c| c.get("created_at")) {
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

    let mut rows = escalations::list_escalations(state.db.pool(), project_id, &filter, limit).await?;
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let escalations: Vec<EscalationSummary> = rows
        .into_iter()
        .map(|row| EscalationSummary {
            escalation_id: row.id.to_string(),
            alias: row.alias,
            subject: row.subject,
            status: row.status,
            created_at: row.created_at.to_rfc3339(),
            expires_at: row.expires_at.map(|t| t.to_rfc3339()),
        })
        .collect();

    let next_cursor = if has_more {
        escalations.last().map(|last| {
            let mut fields = Map::new();
            fields.insert("created_at".into(), json!(last.created_at));
            encode_cursor(&fields)
        })
    } else {
        None
    };

    Ok(Json(ListEscalationsResponse {
        escalations,
        has_more,
        next_cursor,
    }))
}

// ---------------------------------------------------------------------------
// Detail + respond
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EscalationDetailQuery {
    #[serde(default)]
    pub workspace_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EscalationDetail {
    pub escalation_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub member_email: Option<String>,
    pub subject: String,
    pub situation: String,
    pub options: Option<Vec<String>>,
    pub status: String,
    pub response: Option<String>,
    pub response_note: Option<String>,
    pub created_at: String,
    pub responded_at: Option<String>,
    pub expires_at: Option<String>,
}

pub async fn get_escalation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(escalation_id): Path<String>,
    Query(query): Query<EscalationDetailQuery>,
) -> ApiResult<Json<EscalationDetail>> {
    let project_id = get_project_from_auth(&state, &headers).await?;

    let escalation_uuid = Uuid::parse_str(&escalation_id)
        .map_err(|_| ApiError::NotFound("Escalation not found".into()))?;
    let workspace_filter = match &query.workspace_id {
        Some(raw) => {
            let validated = validate_workspace_id(raw).map_err(ApiError::Unprocessable)?;
            Some(
                Uuid::parse_str(&validated)
                    .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?,
            )
        }
        None => None,
    };

    let row =
        escalations::get_escalation(state.db.pool(), project_id, escalation_uuid, workspace_filter)
            .await?
            .ok_or_else(|| ApiError::NotFound("Escalation not found".into()))?;

    let options = row.options.as_ref().and_then(|v| {
        v.as_array().map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    });

    Ok(Json(EscalationDetail {
        escalation_id: row.id.to_string(),
        workspace_id: row.workspace_id.to_string(),
        alias: row.alias,
        member_email: row.member_email,
        subject: row.subject,
        situation: row.situation,
        options,
        status: row.status,
        response: row.response,
        response_note: row.response_note,
        created_at: row.created_at.to_rfc3339(),
        responded_at: row.responded_at.map(|t| t.to_rfc3339()),
        expires_at: row.expires_at.map(|t| t.to_rfc3339()),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RespondEscalationRequest {
    pub response: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RespondEscalationResponse {
    pub escalation_id: String,
    pub status: String,
    pub response: String,
    pub response_note: Option<String>,
    pub responded_at: String,
}

/// Record a human's answer and notify the asking workspace.
pub async fn respond_escalation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(escalation_id): Path<String>,
    Json(payload): Json<RespondEscalationRequest>,
) -> ApiResult<Json<RespondEscalationResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;
    if payload.response.trim().is_empty() {
        return Err(ApiError::Unprocessable("response is required".into()));
    }

    let escalation_uuid = Uuid::parse_str(&escalation_id)
        .map_err(|_| ApiError::NotFound("Escalation not found".into()))?;

    let row = escalations::respond_escalation(
        state.db.pool(),
        project_id,
        escalation_uuid,
        &payload.response,
        payload.note.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::NotFound("Escalation not found".into()))?;

    let workspace_id = row.workspace_id.to_string();
    let mut conn = state.redis();
    let project_slug = bh_presence::get_workspace_project_slug(&mut conn, &workspace_id)
        .await
        .ok()
        .flatten();
    publish_best_effort(
        &state,
        Event::now(
            workspace_id,
            EventKind::EscalationResponded {
                escalation_id: row.id.to_string(),
                response: payload.response,
            },
        )
        .with_project_slug(project_slug),
    )
    .await;

    Ok(Json(RespondEscalationResponse {
        escalation_id: row.id.to_string(),
        status: row.status,
        response: row.response,
        response_note: row.response_note,
        responded_at: row.responded_at.to_rfc3339(),
    }))
}
