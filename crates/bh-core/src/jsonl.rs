//! Bounded JSONL parsing for issue uploads.
//!
//! Clients upload the raw contents of a `.beads/issues.jsonl` file. The
//! parser enforces three independent limits so a hostile body cannot exhaust
//! memory or the stack: total byte size, entry count, and per-entry nesting
//! depth. Depth is measured by an iterative walk over the parsed value rather
//! than during parsing.

use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum accepted JSONL body size: 10 MiB.
pub const MAX_JSONL_SIZE: usize = 10 * 1024 * 1024;

/// Maximum number of issues per upload.
pub const MAX_ISSUES_COUNT: usize = 10_000;

/// Maximum nesting depth per issue object.
pub const MAX_JSON_DEPTH: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JsonlError {
    #[error("JSONL body too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("too many entries: more than {max}")]
    TooManyEntries { max: usize },
    #[error("entry on line {line} exceeds max JSON depth of {max}")]
    TooDeep { line: usize, max: usize },
    #[error("invalid JSON on line {line}: {message}")]
    InvalidJson { line: usize, message: String },
    #[error("entry on line {line} is not a JSON object")]
    NotAnObject { line: usize },
}

/// Parse a JSONL body into a list of JSON objects, enforcing all limits.
/// Blank lines are skipped.
pub fn parse_jsonl(
    body: &str,
    max_depth: usize,
    max_count: usize,
) -> Result<Vec<Map<String, Value>>, JsonlError> {
    if body.len() > MAX_JSONL_SIZE {
        return Err(JsonlError::TooLarge {
            size: body.len(),
            max: MAX_JSONL_SIZE,
        });
    }

    let mut entries = Vec::new();
    for (idx, raw_line) in body.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if entries.len() >= max_count {
            return Err(JsonlError::TooManyEntries { max: max_count });
        }

        let value: Value = serde_json::from_str(line).map_err(|e| JsonlError::InvalidJson {
            line: idx + 1,
            message: e.to_string(),
        })?;

        if json_depth(&value) > max_depth {
            return Err(JsonlError::TooDeep {
                line: idx + 1,
                max: max_depth,
            });
        }

        match value {
            Value::Object(obj) => entries.push(obj),
            _ => return Err(JsonlError::NotAnObject { line: idx + 1 }),
        }
    }

    Ok(entries)
}

/// Structural nesting depth of a JSON value. Scalars are depth 1; each
/// enclosing array or object adds one. Iterative so attacker-controlled
/// nesting cannot blow the stack.
pub fn json_depth(value: &Value) -> usize {
    let mut max_depth = 0usize;
    let mut stack: Vec<(&Value, usize)> = vec![(value, 1)];

    while let Some((node, depth)) = stack.pop() {
        max_depth = max_depth.max(depth);
        match node {
            Value::Array(items) => {
                for item in items {
                    stack.push((item, depth + 1));
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    stack.push((item, depth + 1));
                }
            }
            _ => {}
        }
    }

    max_depth
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn nested(depth: usize) -> String {
        let mut s = String::new();
        for _ in 0..depth {
            s.push_str("{\"a\":");
        }
        s.push('1');
        for _ in 0..depth {
            s.push('}');
        }
        s
    }

    #[test]
    fn parses_objects_and_skips_blank_lines() {
        let body = "{\"id\":\"bd-1\"}\n\n{\"id\":\"bd-2\"}\n";
        let entries = parse_jsonl(body, MAX_JSON_DEPTH, MAX_ISSUES_COUNT).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["id"], "bd-2");
    }

    #[test]
    fn rejects_non_objects() {
        let err = parse_jsonl("[1,2,3]", MAX_JSON_DEPTH, 10).unwrap_err();
        assert_eq!(err, JsonlError::NotAnObject { line: 1 });
    }

    #[test]
    fn rejects_invalid_json_with_line_number() {
        let err = parse_jsonl("{\"ok\":1}\n{broken", MAX_JSON_DEPTH, 10).unwrap_err();
        assert!(matches!(err, JsonlError::InvalidJson { line: 2, .. }));
    }

    #[test]
    fn depth_boundary_is_inclusive() {
        // Depth of exactly the limit passes; one deeper fails.
        let ok = nested(MAX_JSON_DEPTH - 1); // scalar adds the final level
        assert!(parse_jsonl(&ok, MAX_JSON_DEPTH, 10).is_ok());

        let too_deep = nested(MAX_JSON_DEPTH);
        let err = parse_jsonl(&too_deep, MAX_JSON_DEPTH, 10).unwrap_err();
        assert!(matches!(err, JsonlError::TooDeep { line: 1, .. }));
    }

    #[test]
    fn count_boundary_is_inclusive() {
        let body: String = (0..3).map(|i| format!("{{\"id\":\"bd-{i}\"}}\n")).collect();
        assert!(parse_jsonl(&body, MAX_JSON_DEPTH, 3).is_ok());
        let err = parse_jsonl(&body, MAX_JSON_DEPTH, 2).unwrap_err();
        assert_eq!(err, JsonlError::TooManyEntries { max: 2 });
    }

    #[test]
    fn size_limit_checked_before_parse() {
        let body = "x".repeat(MAX_JSONL_SIZE + 1);
        let err = parse_jsonl(&body, MAX_JSON_DEPTH, 10).unwrap_err();
        assert!(matches!(err, JsonlError::TooLarge { .. }));
    }

    #[test]
    fn depth_of_scalars_and_flat_objects() {
        assert_eq!(json_depth(&serde_json::json!(42)), 1);
        assert_eq!(json_depth(&serde_json::json!({"a": 1})), 2);
        assert_eq!(json_depth(&serde_json::json!({"a": [1, 2]})), 3);
    }
}
