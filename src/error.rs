//! Error types for the NVM tier

use thiserror::Error;

/// Result type for NVM tier operations
pub type Result<T> = std::result::Result<T, NvmError>;

/// Recoverable NVM tier errors.
///
/// Broken invariants inside the skip list or arena are not represented
/// here: those abort through `assert!`/`panic!` because continuing would
/// corrupt the node graph.
#[derive(Error, Debug)]
pub enum NvmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage corruption detected: {0}")]
    Corruption(String),

    #[error("Filter size mismatch: expected {expected} bits, got {actual}")]
    FilterMismatch { expected: usize, actual: usize },

    #[error("Write buffer full")]
    WriteBufferFull,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for NvmError {
    fn from(e: serde_json::Error) -> Self {
        NvmError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for NvmError {
    fn from(e: toml::de::Error) -> Self {
        NvmError::Config(e.to_string())
    }
}

impl NvmError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, NvmError::Io(_) | NvmError::WriteBufferFull)
    }

    /// Check if error indicates data corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, NvmError::Corruption(_) | NvmError::FilterMismatch { .. })
    }

    /// Stable numeric code for callers outside Rust
    pub fn code(&self) -> i32 {
        match self {
            NvmError::Io(_) => 1,
            NvmError::Corruption(_) => 2,
            NvmError::FilterMismatch { .. } => 3,
            NvmError::WriteBufferFull => 15,
            NvmError::InvalidConfig(_) => 17,
            NvmError::Config(_) => 18,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        let err = NvmError::Corruption("Compaction has no partner table".into());
        assert!(err.is_corruption());
        assert!(!err.is_retryable());
        assert_eq!(err.code(), 2);

        let err = NvmError::FilterMismatch { expected: 64, actual: 128 };
        assert!(err.is_corruption());
        assert!(err.to_string().contains("64"));
    }
}
