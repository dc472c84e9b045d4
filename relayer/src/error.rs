// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayerError {
    // Provider answered with an error that is expected to clear on retry
    TransientProviderError(String),
    // Provider answered with a non-transient error
    ProviderError(String),
    // Durable state store failure
    StorageError(String),
    // Task queue failure (closed channel, broker refusal)
    QueueError(String),
    // Distributed lock failure
    LockError(String),
    // Failure to encode/decode a task or payload
    SerializationError(String),
    // Node config does not match the connected chain
    IncompatibleChain(String),
    // Node config is malformed
    InvalidConfig(String),
    // Uncategorized error
    Generic(String),
}

impl RelayerError {
    /// Short string identifying the error type for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayerError::TransientProviderError(_) => "transient_provider_error",
            RelayerError::ProviderError(_) => "provider_error",
            RelayerError::StorageError(_) => "storage_error",
            RelayerError::QueueError(_) => "queue_error",
            RelayerError::LockError(_) => "lock_error",
            RelayerError::SerializationError(_) => "serialization_error",
            RelayerError::IncompatibleChain(_) => "incompatible_chain",
            RelayerError::InvalidConfig(_) => "invalid_config",
            RelayerError::Generic(_) => "generic",
        }
    }

    /// Errors worth retrying with backoff rather than surfacing as a task failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayerError::TransientProviderError(_))
    }
}

impl std::fmt::Display for RelayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayerError::TransientProviderError(msg) => {
                write!(f, "transient provider error: {}", msg)
            }
            RelayerError::ProviderError(msg) => write!(f, "provider error: {}", msg),
            RelayerError::StorageError(msg) => write!(f, "storage error: {}", msg),
            RelayerError::QueueError(msg) => write!(f, "queue error: {}", msg),
            RelayerError::LockError(msg) => write!(f, "lock error: {}", msg),
            RelayerError::SerializationError(msg) => write!(f, "serialization error: {}", msg),
            RelayerError::IncompatibleChain(msg) => write!(f, "incompatible chain: {}", msg),
            RelayerError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            RelayerError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RelayerError {}

pub type RelayerResult<T> = Result<T, RelayerError>;
