//! Database error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// A unique constraint fired. Carries the constraint name so callers can
    /// turn it into a 409 naming the colliding field.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error(transparent)]
    Sqlx(sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            // Postgres unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return DbError::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        DbError::Sqlx(err)
    }
}

impl DbError {
    /// True when this error is a unique violation on the given constraint.
    pub fn is_unique_on(&self, constraint: &str) -> bool {
        matches!(self, DbError::UniqueViolation { constraint: c } if c == constraint)
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DbError::UniqueViolation { .. })
    }
}
