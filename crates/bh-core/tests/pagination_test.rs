//! Cursor pagination contract: opaque URL-safe tokens, strict decoding, and
//! bounded limits.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use bh_core::pagination::{
    decode_cursor, encode_cursor, validate_pagination_params, CursorError, DEFAULT_PAGE_LIMIT,
    MAX_PAGE_LIMIT,
};

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn cursors_are_url_safe() {
    // Timestamps with offsets produce '+' in the payload; the encoding must
    // keep the token safe for query strings without percent-escaping.
    let cursor = encode_cursor(&fields(&[(
        "updated_at",
        json!("2026-03-01T12:00:00+00:00"),
    )]));
    assert!(!cursor.contains('+'));
    assert!(!cursor.contains('/'));
    assert!(!cursor.contains('='));
}

#[test]
fn decode_rejects_tampering() {
    let cursor = encode_cursor(&fields(&[("claimed_at", json!("2026-03-01T12:00:00+00:00"))]));

    // Flip a character in the middle of the token.
    let mut tampered: Vec<char> = cursor.chars().collect();
    let mid = tampered.len() / 2;
    tampered[mid] = if tampered[mid] == 'A' { 'B' } else { 'A' };
    let tampered: String = tampered.into_iter().collect();

    // Either the base64 or the JSON layer must refuse; silently decoding to
    // a different object would poison the pagination predicate.
    match decode_cursor(&tampered) {
        Err(CursorError::Base64) | Err(CursorError::Json) => {}
        Ok(decoded) => assert_ne!(Some(&json!("2026-03-01T12:00:00+00:00")), {
            decoded.get("claimed_at")
        }),
        Err(other) => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn truncated_cursor_rejected() {
    let cursor = encode_cursor(&fields(&[("updated_at", json!("2026-03-01T12:00:00+00:00"))]));
    let truncated = &cursor[..cursor.len() - 4];
    assert!(decode_cursor(truncated).is_err());
}

#[test]
fn non_object_payload_rejected() {
    let array_cursor = URL_SAFE_NO_PAD.encode(b"[\"a\", \"b\"]");
    assert_eq!(decode_cursor(&array_cursor), Err(CursorError::Json));

    let scalar_cursor = URL_SAFE_NO_PAD.encode(b"42");
    assert_eq!(decode_cursor(&scalar_cursor), Err(CursorError::Json));
}

#[test]
fn limits_are_clamped_not_silently_adjusted() {
    assert_eq!(
        validate_pagination_params(None, None).unwrap().0,
        DEFAULT_PAGE_LIMIT
    );
    assert_eq!(
        validate_pagination_params(Some(MAX_PAGE_LIMIT), None)
            .unwrap()
            .0,
        MAX_PAGE_LIMIT
    );
    assert_eq!(
        validate_pagination_params(Some(0), None),
        Err(CursorError::Limit)
    );
    assert_eq!(
        validate_pagination_params(Some(MAX_PAGE_LIMIT + 1), None),
        Err(CursorError::Limit)
    );
}

#[test]
fn blank_cursor_is_no_cursor() {
    let (_, cursor) = validate_pagination_params(None, Some("   ")).unwrap();
    assert!(cursor.is_none());
}

#[test]
fn cursor_survives_a_round_trip_through_validation() {
    let original = fields(&[
        ("sort_time", json!("2026-03-01T12:00:00+00:00")),
        ("priority", json!(0)),
        ("bead_id", json!("bd-42")),
    ]);
    let token = encode_cursor(&original);
    let (_, decoded) = validate_pagination_params(Some(25), Some(&token)).unwrap();
    assert_eq!(decoded.unwrap(), original);
}
