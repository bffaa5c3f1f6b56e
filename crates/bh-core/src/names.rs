//! Classic name allocation for workspace aliases.
//!
//! New agents get predictable, human-friendly aliases like `alice-programmer`
//! or `frank-02-reviewer`. The prefix pool cycles through the classic
//! cryptography cast; once the bare names run out, numbered variants
//! (`alice-01` .. `alice-99`) keep allocation going.

/// Prefix pool, in allocation order.
pub const CLASSIC_NAMES: &[&str] = &[
    "alice", "bob", "carol", "dave", "eve", "frank", "grace", "heidi", "ivan", "judy", "mallory",
    "niaj", "olivia", "peggy", "quentin", "rupert", "sybil", "trent", "ursula", "victor", "walter",
    "wendy",
];

/// Extract the name prefix from an alias: `alice-programmer` → `alice`,
/// `alice-01-programmer` → `alice-01`, bare `alice` → `alice`.
pub fn alias_name_prefix(alias: &str) -> Option<String> {
    let parts: Vec<&str> = alias.split('-').collect();
    let first = *parts.first()?;
    if first.is_empty() {
        return None;
    }
    if parts.len() >= 2 && parts[1].chars().all(|c| c.is_ascii_digit()) && !parts[1].is_empty() {
        Some(format!("{}-{}", first, parts[1]).to_ascii_lowercase())
    } else {
        Some(first.to_ascii_lowercase())
    }
}

/// First free name prefix given the aliases already in use. Bare names win
/// over numbered variants; `None` once all 22 × 100 combinations are taken.
pub fn suggest_next_name_prefix<'a, I>(existing_aliases: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let used: std::collections::HashSet<String> = existing_aliases
        .into_iter()
        .filter_map(alias_name_prefix)
        .collect();

    for name in CLASSIC_NAMES {
        if !used.contains(*name) {
            return Some((*name).to_string());
        }
    }

    for num in 1..100 {
        for name in CLASSIC_NAMES {
            let numbered = format!("{name}-{num:02}");
            if !used.contains(&numbered) {
                return Some(numbered);
            }
        }
    }

    None
}

/// Short role suffix folded into generated aliases (`alice-programmer`).
/// Multi-word roles keep their first word.
pub fn role_to_alias_suffix(role: &str) -> String {
    let word = role
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("agent")
        .to_ascii_lowercase();
    let cleaned: String = word
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "agent".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_extraction() {
        assert_eq!(alias_name_prefix("alice-programmer").as_deref(), Some("alice"));
        assert_eq!(alias_name_prefix("alice-01-programmer").as_deref(), Some("alice-01"));
        assert_eq!(alias_name_prefix("alice").as_deref(), Some("alice"));
        assert_eq!(alias_name_prefix(""), None);
    }

    #[test]
    fn suggestion_skips_used_names() {
        let used = ["alice-programmer", "bob", "carol-01-reviewer"];
        assert_eq!(
            suggest_next_name_prefix(used.iter().copied()).as_deref(),
            Some("carol")
        );
    }

    #[test]
    fn suggestion_falls_back_to_numbered() {
        let used: Vec<String> = CLASSIC_NAMES.iter().map(|n| n.to_string()).collect();
        let got = suggest_next_name_prefix(used.iter().map(String::as_str));
        assert_eq!(got.as_deref(), Some("alice-01"));
    }

    #[test]
    fn role_suffix() {
        assert_eq!(role_to_alias_suffix("programmer"), "programmer");
        assert_eq!(role_to_alias_suffix("release engineer"), "release");
        assert_eq!(role_to_alias_suffix("  "), "agent");
    }
}
