//! Process configuration.
//!
//! A flat record read from the environment once at startup. Every option has
//! a documented default so a bare `beadhub` invocation works against local
//! Postgres and Redis.

use thiserror::Error;

/// Default presence TTL: 30 minutes.
pub const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 1800;

#[derive(Debug, Error)]
pub enum SettingsError {
    /// An environment variable was present but not parseable as its type.
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Runtime settings for the server process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    /// Dev auto-reload marker. Parsed for CLI parity; the server itself never
    /// restarts on file changes (that belongs to the supervisor).
    pub reload: bool,
    pub log_level: String,
    pub log_json: bool,
    pub presence_ttl_seconds: u64,
    /// Default human name attributed to dashboard workspaces.
    pub dashboard_human: String,
    /// Secret used to verify proxy-injected `X-BH-Auth` contexts. Unset in
    /// standalone deployments, where those headers are ignored.
    pub internal_auth_secret: Option<String>,
    /// Key under which custodial agent signing keys are sealed at rest.
    pub custody_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost:5432/beadhub".into(),
            redis_url: "redis://localhost:6379/0".into(),
            host: "0.0.0.0".into(),
            port: 8320,
            reload: false,
            log_level: "info".into(),
            log_json: true,
            presence_ttl_seconds: DEFAULT_PRESENCE_TTL_SECONDS,
            dashboard_human: String::new(),
            internal_auth_secret: None,
            custody_key: None,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut s = Self::default();

        if let Some(v) = env_var("BEADHUB_DATABASE_URL") {
            s.database_url = v;
        }
        if let Some(v) = env_var("BEADHUB_REDIS_URL") {
            s.redis_url = v;
        }
        if let Some(v) = env_var("BEADHUB_HOST") {
            s.host = v;
        }
        if let Some(v) = env_var("BEADHUB_PORT") {
            s.port = v.parse().map_err(|_| SettingsError::Invalid {
                var: "BEADHUB_PORT",
                value: v,
            })?;
        }
        if let Some(v) = env_var("BEADHUB_RELOAD") {
            s.reload = parse_bool(&v).ok_or(SettingsError::Invalid {
                var: "BEADHUB_RELOAD",
                value: v,
            })?;
        }
        if let Some(v) = env_var("BEADHUB_LOG_LEVEL") {
            s.log_level = v;
        }
        if let Some(v) = env_var("BEADHUB_LOG_JSON") {
            s.log_json = parse_bool(&v).ok_or(SettingsError::Invalid {
                var: "BEADHUB_LOG_JSON",
                value: v,
            })?;
        }
        if let Some(v) = env_var("BEADHUB_PRESENCE_TTL_SECONDS") {
            s.presence_ttl_seconds = v.parse().map_err(|_| SettingsError::Invalid {
                var: "BEADHUB_PRESENCE_TTL_SECONDS",
                value: v,
            })?;
        }
        if let Some(v) = env_var("BEADHUB_DASHBOARD_HUMAN") {
            s.dashboard_human = v;
        }
        // Embedded/proxy deployments may reuse SESSION_SECRET_KEY to sign
        // X-BH-Auth. Standalone installs leave both unset.
        s.internal_auth_secret =
            env_var("BEADHUB_INTERNAL_AUTH_SECRET").or_else(|| env_var("SESSION_SECRET_KEY"));
        s.custody_key = env_var("BEADHUB_CUSTODY_KEY");

        Ok(s)
    }
}

fn env_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.port, 8320);
        assert_eq!(s.presence_ttl_seconds, DEFAULT_PRESENCE_TTL_SECONDS);
        assert!(s.internal_auth_secret.is_none());
        assert!(s.log_json);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("banana"), None);
    }
}
