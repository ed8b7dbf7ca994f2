// Error types for indexing, storage and configuration

use thiserror::Error;

/// Errors raised by the index store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Main error type for codeatlas operations.
#[derive(Error, Debug)]
pub enum AtlasError {
    /// A single file could not be extracted. Never aborts a batch.
    #[error("extraction failed for {path}: {message}")]
    Extraction { path: String, message: String },

    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("extraction of {path} timed out after {millis}ms")]
    Timeout { path: String, millis: u64 },

    /// Store failure during `operation`. Aborts the current run; files
    /// committed before the failure stay intact.
    #[error("index store failed during {operation} of {path}: {source}")]
    Store {
        path: String,
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AtlasError {
    pub fn store(path: impl Into<String>, operation: &'static str, source: StoreError) -> Self {
        Self::Store {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Per-file failures are isolated; everything else aborts a run.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            Self::Extraction { .. } | Self::Read { .. } | Self::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AtlasError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_names_path_and_operation() {
        let err = AtlasError::store(
            "src/auth.py",
            "upsert_file",
            StoreError::Corrupt("bad kind".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("src/auth.py"));
        assert!(msg.contains("upsert_file"));
        assert!(!err.is_per_file());
    }

    #[test]
    fn test_per_file_classification() {
        let err = AtlasError::Timeout {
            path: "big.py".to_string(),
            millis: 10,
        };
        assert!(err.is_per_file());
        assert!(!AtlasError::Config("x".to_string()).is_per_file());
    }
}
