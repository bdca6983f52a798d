//! Error types for checkpoint operations
//!
//! Every failure carries an [`ErrorContext`] naming the operation and the
//! thread/namespace it targeted, so callers can log and correlate without
//! re-deriving where the error came from.

use std::fmt;
use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Boxed source error from a storage driver
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Operation and key a failure belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Name of the store operation (`put`, `get`, `list`, ...)
    pub operation: &'static str,

    /// Thread the operation targeted
    pub thread_id: Option<String>,

    /// Namespace the operation targeted
    pub namespace: Option<String>,
}

impl ErrorContext {
    /// Create a context for an operation with no key yet
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            thread_id: None,
            namespace: None,
        }
    }

    /// Set the thread ID
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.operation.is_empty() && self.thread_id.is_none() && self.namespace.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.operation.is_empty() {
            "backend"
        } else {
            self.operation
        };
        write!(f, "{}", op)?;
        if let Some(thread_id) = &self.thread_id {
            write!(f, " thread_id={:?}", thread_id)?;
        }
        if let Some(namespace) = &self.namespace {
            write!(f, " namespace={:?}", namespace)?;
        }
        Ok(())
    }
}

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Malformed input; never retried
    #[error("[{context}] validation failed: {message}")]
    Validation {
        context: ErrorContext,
        message: String,
    },

    /// Id or version collision; re-read and retry
    #[error("[{context}] conflict: {message}")]
    Conflict {
        context: ErrorContext,
        message: String,
    },

    /// Target of an operation that requires it does not exist
    #[error("[{context}] not found: {message}")]
    NotFound {
        context: ErrorContext,
        message: String,
    },

    /// Transient backend failure; safe to retry with backoff
    #[error("[{context}] storage unavailable: {message}")]
    StorageUnavailable {
        context: ErrorContext,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Payload serialization or transform failure
    #[error("[{context}] serialization error: {message}")]
    Serialization {
        context: ErrorContext,
        message: String,
    },

    /// Caller cancelled the operation before it committed
    #[error("[{context}] operation cancelled")]
    Cancelled { context: ErrorContext },

    /// Caller deadline elapsed before the operation committed
    #[error("[{context}] deadline exceeded")]
    DeadlineExceeded { context: ErrorContext },

    /// Invalid store configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl CheckpointError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            context: ErrorContext::default(),
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            context: ErrorContext::default(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            context: ErrorContext::default(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            context: ErrorContext::default(),
            message: message.into(),
            source: None,
        }
    }

    /// Storage failure wrapping the driver error
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StorageUnavailable {
            context: ErrorContext::default(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            context: ErrorContext::default(),
            message: message.into(),
        }
    }

    /// Fill in the operation context if the error does not carry one yet
    pub fn in_context(mut self, ctx: &ErrorContext) -> Self {
        if let Some(slot) = self.context_mut() {
            if slot.is_empty() {
                *slot = ctx.clone();
            }
        }
        self
    }

    /// Context the error was raised in, if any
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Validation { context, .. }
            | Self::Conflict { context, .. }
            | Self::NotFound { context, .. }
            | Self::StorageUnavailable { context, .. }
            | Self::Serialization { context, .. }
            | Self::Cancelled { context }
            | Self::DeadlineExceeded { context } => Some(context),
            Self::Config(_) => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::Validation { context, .. }
            | Self::Conflict { context, .. }
            | Self::NotFound { context, .. }
            | Self::StorageUnavailable { context, .. }
            | Self::Serialization { context, .. }
            | Self::Cancelled { context }
            | Self::DeadlineExceeded { context } => Some(context),
            Self::Config(_) => None,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
