//! Shared foundation for the BeadHub coordination hub.
//!
//! Everything here is pure and I/O-free: configuration, input validation,
//! Git origin canonicalization, bounded JSONL parsing, pagination cursors,
//! and the classic-name allocator used when bootstrapping new workspaces.

pub mod canonical;
pub mod config;
pub mod jsonl;
pub mod names;
pub mod pagination;
pub mod validate;

pub use canonical::{canonicalize_git_url, extract_repo_name, OriginError};
pub use config::{Settings, SettingsError};
pub use jsonl::{parse_jsonl, JsonlError};
pub use pagination::{
    decode_cursor, encode_cursor, validate_pagination_params, CursorError, DEFAULT_PAGE_LIMIT,
    MAX_PAGE_LIMIT,
};
