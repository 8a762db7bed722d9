//! Error types for TsMerge

use thiserror::Error;

/// Result type alias for TsMerge operations
pub type Result<T> = std::result::Result<T, MergeError>;

/// TsMerge error types
#[derive(Error, Debug)]
pub enum MergeError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Chunk payload could not be decoded into points
    #[error("Decode error: {0}")]
    Decode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A sequence file would overlap a sibling sequence file
    #[error("Sequence overlap: {0}")]
    Overlap(String),

    /// Storage group not found
    #[error("Storage group not found: {0}")]
    StorageGroupNotFound(String),

    /// TsFile not tracked by the file set
    #[error("TsFile not found: {0}")]
    FileNotFound(u64),

    /// Merge task aborted before commit
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// Merge log replay error
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MergeError {
    /// Check if error is retryable on the next scheduling cycle
    pub fn is_retryable(&self) -> bool {
        matches!(self, MergeError::Io(_) | MergeError::MergeAborted(_))
    }

    /// Check if error indicates corruption of an input chunk or file
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            MergeError::Corruption(_)
                | MergeError::ChecksumMismatch { .. }
                | MergeError::Decode(_)
                | MergeError::InvalidFormat(_)
                | MergeError::Compression(_)
        )
    }
}

impl From<bincode::Error> for MergeError {
    fn from(e: bincode::Error) -> Self {
        MergeError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = MergeError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let crc = MergeError::ChecksumMismatch { expected: 1, actual: 2 };
        assert!(crc.is_corruption());
        assert!(!crc.is_retryable());
    }
}
