//! Actor-binding and proxy-context behavior through the crate's public API.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use uuid::Uuid;

use bh_server::auth::{enforce_actor_binding, parse_bearer_token, AuthIdentity, AuthMode};
use bh_server::internal_auth::{
    internal_auth_header_value, is_public_reader, parse_internal_auth_context,
    INTERNAL_ACTOR_ID_HEADER, INTERNAL_AUTH_HEADER, INTERNAL_PROJECT_HEADER,
};

fn bearer_identity(agent_id: Uuid) -> AuthIdentity {
    AuthIdentity {
        project_id: Uuid::new_v4(),
        agent_id: Some(agent_id),
        api_key_id: Some(Uuid::new_v4()),
        user_id: None,
        auth_mode: AuthMode::Bearer,
    }
}

#[test]
fn bearer_key_mutates_only_its_own_workspace() {
    let agent = Uuid::new_v4();

    assert!(enforce_actor_binding(&bearer_identity(agent), agent).is_ok());

    let err = enforce_actor_binding(&bearer_identity(agent), Uuid::new_v4()).unwrap_err();
    let response = err.into_response();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[test]
fn proxy_mode_delegates_binding_to_the_wrapper() {
    let identity = AuthIdentity {
        auth_mode: AuthMode::Proxy,
        ..bearer_identity(Uuid::new_v4())
    };
    assert!(enforce_actor_binding(&identity, Uuid::new_v4()).is_ok());
}

#[test]
fn bearer_header_parsing_is_strict() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Bearer aw_sk_x"));
    assert_eq!(parse_bearer_token(&headers), Some("aw_sk_x"));

    headers.insert("authorization", HeaderValue::from_static("bearer aw_sk_x"));
    assert_eq!(parse_bearer_token(&headers), None);

    headers.insert("authorization", HeaderValue::from_static("Bearer "));
    assert_eq!(parse_bearer_token(&headers), None);
}

#[test]
fn public_reader_context_is_read_only_marker() {
    let secret = "proxy-secret";
    let project = Uuid::new_v4();
    let actor = Uuid::new_v4();
    let value = internal_auth_header_value(
        secret,
        &project.to_string(),
        "p",
        "public",
        &actor.to_string(),
    );

    let mut headers = HeaderMap::new();
    headers.insert(INTERNAL_AUTH_HEADER, HeaderValue::from_str(&value).unwrap());
    headers.insert(
        INTERNAL_PROJECT_HEADER,
        HeaderValue::from_str(&project.to_string()).unwrap(),
    );
    headers.insert(
        INTERNAL_ACTOR_ID_HEADER,
        HeaderValue::from_str(&actor.to_string()).unwrap(),
    );

    assert!(is_public_reader(&headers, Some(secret)));
    // A different secret invalidates the signature entirely.
    assert!(parse_internal_auth_context(&headers, Some("other-secret")).is_err());
    // Without a configured secret the header is ignored, not trusted.
    assert!(!is_public_reader(&headers, None));
}
