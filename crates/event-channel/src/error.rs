use thiserror::Error;

/// Errors that can occur when interacting with the event channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The broker could not be reached or refused the request.
    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    /// The broker did not acknowledge a publish within the allowed time.
    #[error("Publish to '{topic}' was not acknowledged within {timeout_ms}ms")]
    AckTimeout { topic: String, timeout_ms: u64 },

    /// A required envelope field was not provided to the builder.
    #[error("Envelope is missing required field '{0}'")]
    MissingField(&'static str),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChannelError {
    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Unavailable(_) | ChannelError::AckTimeout { .. } | ChannelError::Database(_)
        )
    }
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
