//! Trusted-proxy authentication context.
//!
//! A wrapper deployment authenticates the caller itself (JWT, cookie, or its
//! own keys) and injects project scope into the core via signed headers. The
//! signature covers `v2:<project>:<principal_type>:<principal_id>:<actor>`
//! with HMAC-SHA256 under a shared secret; the full header value appends the
//! hex signature as a fifth segment.
//!
//! These headers are untrusted input. Without a configured secret they are
//! logged and ignored — never honored — so a standalone install cannot be
//! spoofed into proxy mode.

use axum::http::HeaderMap;
use ring::hmac;
use subtle::ConstantTimeEq;
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;

pub const INTERNAL_AUTH_HEADER: &str = "x-bh-auth";
pub const INTERNAL_PROJECT_HEADER: &str = "x-project-id";
pub const INTERNAL_USER_HEADER: &str = "x-user-id";
pub const INTERNAL_API_KEY_ID_HEADER: &str = "x-api-key";
pub const INTERNAL_ACTOR_ID_HEADER: &str = "x-aweb-actor-id";

/// Public readers authenticate as this principal type; they get read-only,
/// redacted access to public projects.
pub const PRINCIPAL_PUBLIC: &str = "p";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalAuthContext {
    pub project_id: Uuid,
    pub principal_type: String,
    pub principal_id: String,
    pub actor_id: Uuid,
}

/// Compute the full signed header value for the given context.
pub fn internal_auth_header_value(
    secret: &str,
    project_id: &str,
    principal_type: &str,
    principal_id: &str,
    actor_id: &str,
) -> String {
    let msg = format!("v2:{project_id}:{principal_type}:{principal_id}:{actor_id}");
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, msg.as_bytes());
    let mut sig = String::with_capacity(64);
    for byte in tag.as_ref() {
        sig.push_str(&format!("{byte:02x}"));
    }
    format!("{msg}:{sig}")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_uuid_header(value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value.trim()).map_err(|_| ApiError::auth_required())
}

/// Parse and validate the proxy-injected context.
///
/// Returns `Ok(None)` when the request carries no `X-BH-Auth` header, or
/// when no secret is configured (the header is then ignored with a warning
/// rather than trusted or rejected).
pub fn parse_internal_auth_context(
    headers: &HeaderMap,
    secret: Option<&str>,
) -> Result<Option<InternalAuthContext>, ApiError> {
    let Some(supplied) = header_str(headers, INTERNAL_AUTH_HEADER) else {
        return Ok(None);
    };

    let Some(secret) = secret else {
        warn!("ignoring {INTERNAL_AUTH_HEADER} header: no internal auth secret configured");
        return Ok(None);
    };

    let project_id_str = header_str(headers, INTERNAL_PROJECT_HEADER)
        .ok_or_else(ApiError::auth_required)?
        .trim()
        .to_string();
    let project_id = parse_uuid_header(&project_id_str)?;

    let user_id = header_str(headers, INTERNAL_USER_HEADER).map(str::trim);
    let api_key_id = header_str(headers, INTERNAL_API_KEY_ID_HEADER).map(str::trim);

    let (principal_type, principal_id) = if let Some(user_id) = user_id.filter(|s| !s.is_empty()) {
        let user_uuid = parse_uuid_header(user_id)?;
        ("u".to_string(), user_uuid.to_string())
    } else if let Some(api_key_id) = api_key_id.filter(|s| !s.is_empty()) {
        let key_uuid = parse_uuid_header(api_key_id)?;
        ("k".to_string(), key_uuid.to_string())
    } else {
        // No user or API-key header: the signed value itself may carry a
        // different principal type (public readers arrive this way).
        let parts: Vec<&str> = supplied.split(':').collect();
        match parts.as_slice() {
            ["v2", _, ptype, pid, ..] if !matches!(*ptype, "u" | "k") && parts.len() >= 5 => {
                (ptype.to_string(), pid.to_string())
            }
            _ => return Err(ApiError::auth_required()),
        }
    };

    let actor_str = header_str(headers, INTERNAL_ACTOR_ID_HEADER)
        .ok_or_else(ApiError::auth_required)?
        .trim()
        .to_string();
    let actor_id = parse_uuid_header(&actor_str)?;

    let expected = internal_auth_header_value(
        secret,
        &project_id.to_string(),
        &principal_type,
        &principal_id,
        &actor_id.to_string(),
    );
    let valid: bool = supplied.as_bytes().ct_eq(expected.as_bytes()).into();
    if !valid {
        return Err(ApiError::auth_required());
    }

    Ok(Some(InternalAuthContext {
        project_id,
        principal_type,
        principal_id,
        actor_id,
    }))
}

/// True when the request comes from a trusted wrapper as a public reader.
pub fn is_public_reader(headers: &HeaderMap, secret: Option<&str>) -> bool {
    matches!(
        parse_internal_auth_context(headers, secret),
        Ok(Some(ctx)) if ctx.principal_type == PRINCIPAL_PUBLIC
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret";

    fn headers_for(project: &Uuid, user: Option<&Uuid>, actor: &Uuid, auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            INTERNAL_AUTH_HEADER,
            HeaderValue::from_str(auth).unwrap(),
        );
        headers.insert(
            INTERNAL_PROJECT_HEADER,
            HeaderValue::from_str(&project.to_string()).unwrap(),
        );
        if let Some(user) = user {
            headers.insert(
                INTERNAL_USER_HEADER,
                HeaderValue::from_str(&user.to_string()).unwrap(),
            );
        }
        headers.insert(
            INTERNAL_ACTOR_ID_HEADER,
            HeaderValue::from_str(&actor.to_string()).unwrap(),
        );
        headers
    }

    #[test]
    fn valid_user_context_verifies() {
        let project = Uuid::new_v4();
        let user = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let auth = internal_auth_header_value(
            SECRET,
            &project.to_string(),
            "u",
            &user.to_string(),
            &actor.to_string(),
        );
        let headers = headers_for(&project, Some(&user), &actor, &auth);

        let ctx = parse_internal_auth_context(&headers, Some(SECRET))
            .unwrap()
            .unwrap();
        assert_eq!(ctx.project_id, project);
        assert_eq!(ctx.principal_type, "u");
        assert_eq!(ctx.actor_id, actor);
    }

    #[test]
    fn tampered_signature_rejected() {
        let project = Uuid::new_v4();
        let user = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let mut auth = internal_auth_header_value(
            SECRET,
            &project.to_string(),
            "u",
            &user.to_string(),
            &actor.to_string(),
        );
        auth.pop();
        auth.push('0');
        let headers = headers_for(&project, Some(&user), &actor, &auth);

        assert!(parse_internal_auth_context(&headers, Some(SECRET)).is_err());
    }

    #[test]
    fn missing_secret_ignores_headers() {
        let project = Uuid::new_v4();
        let user = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let auth = internal_auth_header_value(
            SECRET,
            &project.to_string(),
            "u",
            &user.to_string(),
            &actor.to_string(),
        );
        let headers = headers_for(&project, Some(&user), &actor, &auth);

        // Signed correctly, but without a configured secret nothing is
        // trusted and the caller falls through to bearer auth.
        assert_eq!(parse_internal_auth_context(&headers, None).unwrap(), None);
    }

    #[test]
    fn public_reader_principal_from_signed_header() {
        let project = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let auth = internal_auth_header_value(
            SECRET,
            &project.to_string(),
            PRINCIPAL_PUBLIC,
            "public",
            &actor.to_string(),
        );
        let headers = headers_for(&project, None, &actor, &auth);

        let ctx = parse_internal_auth_context(&headers, Some(SECRET))
            .unwrap()
            .unwrap();
        assert_eq!(ctx.principal_type, PRINCIPAL_PUBLIC);
        assert!(is_public_reader(&headers, Some(SECRET)));
    }

    #[test]
    fn absent_header_is_not_an_error() {
        let headers = HeaderMap::new();
        assert_eq!(
            parse_internal_auth_context(&headers, Some(SECRET)).unwrap(),
            None
        );
        assert!(!is_public_reader(&headers, Some(SECRET)));
    }

    #[test]
    fn missing_actor_rejected() {
        let project = Uuid::new_v4();
        let user = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let auth = internal_auth_header_value(
            SECRET,
            &project.to_string(),
            "u",
            &user.to_string(),
            &actor.to_string(),
        );
        let mut headers = headers_for(&project, Some(&user), &actor, &auth);
        headers.remove(INTERNAL_ACTOR_ID_HEADER);

        assert!(parse_internal_auth_context(&headers, Some(SECRET)).is_err());
    }
}
