//! Cursor-based pagination.
//!
//! Cursors are URL-safe base64 (no padding) of a small JSON object carrying
//! the sort-key fields of the last row on the previous page. They are opaque
//! to clients; a tampered or truncated cursor fails with a typed error that
//! routes surface as 422.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{Map, Value};
use thiserror::Error;

/// Default page size when the client does not ask for one.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Hard ceiling on page size.
pub const MAX_PAGE_LIMIT: i64 = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("Invalid cursor: not valid base64")]
    Base64,
    #[error("Invalid cursor: not a JSON object")]
    Json,
    #[error("limit must be between 1 and {MAX_PAGE_LIMIT}")]
    Limit,
}

/// Encode sort-key fields into an opaque cursor.
pub fn encode_cursor(fields: &Map<String, Value>) -> String {
    let json = serde_json::to_vec(fields).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a cursor back into its sort-key fields.
pub fn decode_cursor(cursor: &str) -> Result<Map<String, Value>, CursorError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|_| CursorError::Base64)?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(CursorError::Json),
    }
}

/// Validate a limit/cursor pair, returning the clamped limit and the decoded
/// cursor fields (if a cursor was supplied).
pub fn validate_pagination_params(
    limit: Option<i64>,
    cursor: Option<&str>,
) -> Result<(i64, Option<Map<String, Value>>), CursorError> {
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit < 1 || limit > MAX_PAGE_LIMIT {
        return Err(CursorError::Limit);
    }
    let cursor_data = match cursor {
        Some(c) if !c.trim().is_empty() => Some(decode_cursor(c)?),
        _ => None,
    };
    Ok((limit, cursor_data))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn round_trip() {
        let original = fields(&[
            ("sort_time", json!("2026-03-01T12:00:00+00:00")),
            ("priority", json!(2)),
            ("bead_id", json!("bd-17")),
        ]);
        let cursor = encode_cursor(&original);
        assert!(!cursor.contains('='));
        let decoded = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn bad_base64_rejected() {
        assert_eq!(decode_cursor("!!!not-base64!!!"), Err(CursorError::Base64));
    }

    #[test]
    fn non_object_rejected() {
        let cursor = URL_SAFE_NO_PAD.encode(b"[1,2,3]");
        assert_eq!(decode_cursor(&cursor), Err(CursorError::Json));
    }

    #[test]
    fn limit_bounds() {
        assert!(validate_pagination_params(Some(0), None).is_err());
        assert!(validate_pagination_params(Some(MAX_PAGE_LIMIT + 1), None).is_err());
        let (limit, cursor) = validate_pagination_params(None, None).unwrap();
        assert_eq!(limit, DEFAULT_PAGE_LIMIT);
        assert!(cursor.is_none());
    }
}
