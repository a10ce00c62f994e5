//! Error types for cache operations

use thiserror::Error;

/// Persistent tier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open storage environment at {path}: {reason}")]
    EnvOpen { path: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Corrupt row for key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("ETag for key {key} is {len} bytes; at most {max} are stored")]
    EtagTooLong { key: String, len: usize, max: usize },

    #[error("Key of {len} bytes is too long to store")]
    KeyTooLong { len: usize },

    #[error("Storage I/O failed: {reason}")]
    Io { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Write-behind queue closed")]
    QueueClosed,
}

/// Value encoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Failed to encode value for key {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("Failed to decode value for key {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all cache errors.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_corrupt() {
        let err = StorageError::Corrupt {
            key: "efforts:abc".to_string(),
            reason: "truncated header".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Corrupt row"));
        assert!(msg.contains("efforts:abc"));
        assert!(msg.contains("truncated header"));
    }

    #[test]
    fn test_serialization_error_display_encode() {
        let err = SerializationError::Encode {
            key: "k".to_string(),
            reason: "key must be a string".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("encode"));
        assert!(msg.contains("key must be a string"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "memory.max_size_bytes".to_string(),
            value: "0".to_string(),
            reason: "must be > 0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("memory.max_size_bytes"));
        assert!(msg.contains("must be > 0"));
    }

    #[test]
    fn test_cache_error_from_variants() {
        let storage = CacheError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, CacheError::Storage(_)));

        let serialization = CacheError::from(SerializationError::Decode {
            key: "k".to_string(),
            reason: "eof".to_string(),
        });
        assert!(matches!(serialization, CacheError::Serialization(_)));

        let config = CacheError::from(ConfigError::MissingRequired {
            field: "disk.path".to_string(),
        });
        assert!(matches!(config, CacheError::Config(_)));
    }

    #[test]
    fn test_storage_error_display_lock_poisoned() {
        let msg = format!("{}", StorageError::LockPoisoned);
        assert!(msg.contains("lock poisoned"));
    }
}
