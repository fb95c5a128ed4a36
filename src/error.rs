//! Central error handling for the tile streaming core.
//!
//! Provides a unified StreamError enum with consistent categorization
//! across registration, loading, and mapping-table operations.

/// Centralized error type for all residency-manager operations
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Tiling error: {0}")]
    Tiling(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Convenience constructors for common error types
    pub fn config<T: ToString>(msg: T) -> Self {
        StreamError::Config(msg.to_string())
    }

    pub fn tiling<T: ToString>(msg: T) -> Self {
        StreamError::Tiling(msg.to_string())
    }

    pub fn loader<T: ToString>(msg: T) -> Self {
        StreamError::Loader(msg.to_string())
    }

    pub fn mapping<T: ToString>(msg: T) -> Self {
        StreamError::Mapping(msg.to_string())
    }
}

/// Result type alias for residency-manager operations
pub type StreamResult<T> = Result<T, StreamError>;
