//! Bead subscription management.
//!
//! A subscription asks: "mail me when this bead changes". The outbox
//! resolves recipients from these rows inside the sync transaction.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bh_core::validate::{
    is_valid_alias, is_valid_bead_id, validate_workspace_id, INVALID_ALIAS_MESSAGE,
};
use bh_db::registry;
use bh_db::subscriptions::{self, SubscriptionRow, VALID_EVENT_TYPES};

use crate::auth::{enforce_actor_binding, get_identity_from_auth};
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub workspace_id: String,
    pub alias: String,
    pub bead_id: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_event_types")]
    pub event_types: Vec<String>,
}

fn default_event_types() -> Vec<String> {
    vec!["status_change".to_string()]
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub subscription_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub bead_id: String,
    pub repo: Option<String>,
    pub event_types: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct ListSubscriptionsResponse {
    pub subscriptions: Vec<SubscriptionView>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub subscription_id: String,
    pub deleted: bool,
}

fn view(row: SubscriptionRow) -> SubscriptionView {
    SubscriptionView {
        subscription_id: row.id.to_string(),
        workspace_id: row.workspace_id.to_string(),
        alias: row.alias,
        bead_id: row.bead_id,
        repo: row.repo,
        event_types: row.event_types,
        created_at: row.created_at.to_rfc3339(),
    }
}

/// Shared gate: workspace must be live in the project and the supplied alias
/// must match it.
async fn verify_subscription_scope(
    state: &SharedState,
    headers: &HeaderMap,
    workspace_id: &str,
    alias: &str,
) -> ApiResult<(Uuid, Uuid)> {
    let identity = get_identity_from_auth(state, headers).await?;
    let validated = validate_workspace_id(workspace_id).map_err(ApiError::Unprocessable)?;
    let workspace_uuid = Uuid::parse_str(&validated)
        .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;
    enforce_actor_binding(&identity, workspace_uuid)?;

    if !is_valid_alias(alias) {
        return Err(ApiError::Unprocessable(INVALID_ALIAS_MESSAGE.into()));
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
    if workspace.alias != alias {
        return Err(ApiError::Forbidden("Alias does not match workspace_id".into()));
    }

    Ok((identity.project_id, workspace_uuid))
}

/// Subscribe to a bead's changes. Idempotent: repeating the same
/// subscription updates its event types instead of duplicating it.
pub async fn subscribe(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscriptionView>> {
    let (project_id, workspace_uuid) =
        verify_subscription_scope(&state, &headers, &payload.workspace_id, &payload.alias).await?;

    if !is_valid_bead_id(&payload.bead_id) {
        return Err(ApiError::BadRequest(format!(
            "Invalid bead_id format: {}",
            &payload.bead_id[..payload.bead_id.len().min(100)]
        )));
    }
    for event_type in &payload.event_types {
        if !VALID_EVENT_TYPES.contains(&event_type.as_str()) {
            return Err(ApiError::BadRequest(format!(
                "Invalid event_type: {event_type}. Valid: {}",
                VALID_EVENT_TYPES.join(", ")
            )));
        }
    }

    let row = subscriptions::upsert_subscription(
        state.db.pool(),
        project_id,
        workspace_uuid,
        &payload.alias,
        &payload.bead_id,
        payload.repo.as_deref(),
        &payload.event_types,
    )
    .await?;

    Ok(Json(view(row)))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionScopeQuery {
    pub workspace_id: String,
    pub alias: String,
}

/// List a workspace's subscriptions.
pub async fn list_subscriptions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<SubscriptionScopeQuery>,
) -> ApiResult<Json<ListSubscriptionsResponse>> {
    let (project_id, workspace_uuid) =
        verify_subscription_scope(&state, &headers, &query.workspace_id, &query.alias).await?;

    let rows =
        subscriptions::list_subscriptions(state.db.pool(), project_id, workspace_uuid).await?;
    let subscriptions: Vec<SubscriptionView> = rows.into_iter().map(view).collect();

    Ok(Json(ListSubscriptionsResponse {
        count: subscriptions.len(),
        subscriptions,
    }))
}

/// Remove one subscription owned by the calling workspace.
pub async fn unsubscribe(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(subscription_id): Path<String>,
    Query(query): Query<SubscriptionScopeQuery>,
) -> ApiResult<Json<UnsubscribeResponse>> {
    let (project_id, workspace_uuid) =
        verify_subscription_scope(&state, &headers, &query.workspace_id, &query.alias).await?;

    let subscription_uuid = Uuid::parse_str(&subscription_id)
        .map_err(|_| ApiError::BadRequest("Invalid subscription_id format".into()))?;

    let deleted = subscriptions::delete_subscription(
        state.db.pool(),
        project_id,
        workspace_uuid,
        &query.alias,
        subscription_uuid,
    )
    .await?;
    if !deleted {
        return Err(ApiError::NotFound("Subscription not found".into()));
    }

    Ok(Json(UnsubscribeResponse {
        subscription_id,
        deleted: true,
    }))
}
