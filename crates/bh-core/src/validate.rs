//! Input validation for identifiers that cross the API boundary.
//!
//! Error messages here are user-facing: route handlers surface them verbatim
//! in 422 responses.

use uuid::Uuid;

/// Maximum length for workspace role descriptions.
pub const ROLE_MAX_LENGTH: usize = 50;

/// User-facing message for invalid roles.
pub const ROLE_ERROR_MESSAGE: &str =
    "Invalid role: letters, digits, spaces, hyphens and underscores, max 50 chars";

/// User-facing message for invalid aliases.
pub const INVALID_ALIAS_MESSAGE: &str =
    "Invalid alias: must be alphanumeric with hyphens/underscores, 1-64 chars";

/// Workspace aliases: alphanumeric start, then alphanumeric/`-`/`_`, 1-64 chars.
pub fn is_valid_alias(alias: &str) -> bool {
    let mut chars = alias.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    alias.len() <= 64
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Human names: 1-64 chars, no control characters.
pub fn is_valid_human_name(name: &str) -> bool {
    !name.is_empty() && name.chars().count() <= 64 && !name.chars().any(char::is_control)
}

/// Roles: short free text, letters/digits/space/hyphen/underscore.
pub fn is_valid_role(role: &str) -> bool {
    !role.is_empty()
        && role.chars().count() <= ROLE_MAX_LENGTH
        && role
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_')
}

/// Canonical role form: trimmed and lowercased.
pub fn normalize_role(role: &str) -> String {
    role.trim().to_ascii_lowercase()
}

/// Git branch names: bounded, no whitespace/control chars, no `..`, and not
/// starting with `-` (keeps them safe as CLI arguments downstream).
pub fn is_valid_branch_name(branch: &str) -> bool {
    !branch.is_empty()
        && branch.len() <= 255
        && !branch.starts_with('-')
        && !branch.contains("..")
        && !branch
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
}

/// Canonical origins look like `host/owner/repo` (two or more slashes worth
/// of non-empty segments, no scheme, no whitespace).
pub fn is_valid_canonical_origin(origin: &str) -> bool {
    if origin.is_empty() || origin.len() > 255 || origin.contains("://") {
        return false;
    }
    if origin.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let segments: Vec<&str> = origin.split('/').collect();
    segments.len() >= 3 && segments.iter().all(|s| !s.is_empty())
}

/// Project slugs: URL-safe, lowercase, 1-256 chars.
pub fn is_valid_project_slug(slug: &str) -> bool {
    let mut chars = slug.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    slug.len() <= 256
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// Bead ids: optionally namespaced `part:part`; each part alphanumeric start,
/// then alphanumeric/`-`/`_`, 1-100 chars.
pub fn is_valid_bead_id(bead_id: &str) -> bool {
    fn part_ok(part: &str) -> bool {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphanumeric() => {}
            _ => return false,
        }
        part.len() <= 100
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
    match bead_id.split_once(':') {
        Some((ns, rest)) => part_ok(ns) && part_ok(rest),
        None => part_ok(bead_id),
    }
}

/// Parse and normalize a workspace id, returning the canonical hyphenated
/// UUID form. The error message is the API message.
pub fn validate_workspace_id(workspace_id: &str) -> Result<String, String> {
    let trimmed = workspace_id.trim();
    if trimmed.is_empty() {
        return Err("workspace_id cannot be empty".into());
    }
    Uuid::parse_str(trimmed)
        .map(|u| u.to_string())
        .map_err(|_| "Invalid workspace_id format".into())
}

/// Hostnames and workspace paths must not smuggle control characters into
/// logs or shell-adjacent tooling. Tabs/newlines are tolerated in paths only.
pub fn has_control_chars(value: &str, allow_tab_newline: bool) -> bool {
    value.chars().any(|c| {
        c == '\0' || (c.is_control() && !(allow_tab_newline && (c == '\t' || c == '\n')))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_rules() {
        assert!(is_valid_alias("alice-programmer"));
        assert!(is_valid_alias("bob_01"));
        assert!(!is_valid_alias(""));
        assert!(!is_valid_alias("-leading-dash"));
        assert!(!is_valid_alias("has space"));
        assert!(!is_valid_alias(&"x".repeat(65)));
    }

    #[test]
    fn branch_rules() {
        assert!(is_valid_branch_name("main"));
        assert!(is_valid_branch_name("feature/claims-v2"));
        assert!(!is_valid_branch_name("../escape"));
        assert!(!is_valid_branch_name("-rf"));
        assert!(!is_valid_branch_name("has space"));
    }

    #[test]
    fn canonical_origin_rules() {
        assert!(is_valid_canonical_origin("github.com/org/repo"));
        assert!(is_valid_canonical_origin("git.internal/team/sub/repo"));
        assert!(!is_valid_canonical_origin("https://github.com/org/repo"));
        assert!(!is_valid_canonical_origin("just-a-name"));
        assert!(!is_valid_canonical_origin("host//repo"));
    }

    #[test]
    fn workspace_id_normalizes() {
        let id = "550E8400-E29B-41D4-A716-446655440000";
        assert_eq!(
            validate_workspace_id(id).unwrap(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
        assert!(validate_workspace_id("").is_err());
        assert!(validate_workspace_id("not-a-uuid").is_err());
    }

    #[test]
    fn bead_id_rules() {
        assert!(is_valid_bead_id("bd-17"));
        assert!(is_valid_bead_id("myrepo:bd-17"));
        assert!(!is_valid_bead_id(":bd-17"));
        assert!(!is_valid_bead_id("bd 17"));
    }

    #[test]
    fn role_rules() {
        assert!(is_valid_role("programmer"));
        assert!(is_valid_role("release engineer"));
        assert!(!is_valid_role(&"r".repeat(51)));
        assert_eq!(normalize_role("  Programmer "), "programmer");
    }
}
