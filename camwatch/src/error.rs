//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// A stored row that no longer decodes (unknown outcome or protocol).
    #[error("corrupt history: {0}")]
    CorruptHistory(String),

    #[error("failed to persist heartbeat for {stream}: {reason}")]
    Persistence { stream: String, reason: String },

    /// Some streams of a batch were written, these were not.
    #[error("{lost} heartbeat(s) not persisted for {streams}: {reason}")]
    PartialWrite {
        lost: usize,
        streams: String,
        reason: String,
    },

    #[error("invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{entity} '{name}' not found")]
    NotFound { entity: &'static str, name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            name: name.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn persistence(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Persistence {
            stream: stream.into(),
            reason: reason.into(),
        }
    }

    /// `SQLITE_BUSY` (5) or `SQLITE_LOCKED` (6), by code or by message.
    pub fn is_sqlite_busy(&self) -> bool {
        let Error::Sqlite(err) = self else {
            return false;
        };
        if let sqlx::Error::Database(db) = err
            && matches!(db.code().as_deref(), Some("5" | "6"))
        {
            return true;
        }
        let msg = err.to_string().to_ascii_lowercase();
        msg.contains("database is locked") || msg.contains("database is busy")
    }

    /// A statement hit a table that is not there.
    pub fn is_missing_table(&self) -> bool {
        matches!(self, Error::Sqlite(err) if err.to_string().contains("no such table"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_detection() {
        let locked = Error::Sqlite(sqlx::Error::Protocol("database is locked".to_string()));
        assert!(locked.is_sqlite_busy());
        assert!(!Error::Sqlite(sqlx::Error::RowNotFound).is_sqlite_busy());
        assert!(!Error::persistence("gate", "database is locked").is_sqlite_busy());
    }

    #[test]
    fn test_missing_table_detection() {
        let missing = Error::Sqlite(sqlx::Error::Protocol("no such table: log_gate".to_string()));
        assert!(missing.is_missing_table());
        assert!(!missing.is_sqlite_busy());
        assert!(!Error::persistence("gate", "no such table").is_missing_table());
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(
            Error::not_found("Stream", "gate").to_string(),
            "Stream 'gate' not found"
        );
    }
}
