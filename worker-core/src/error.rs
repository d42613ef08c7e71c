use serde_json::Value;
use thiserror::Error;

use crate::broker::BrokerError;

/// Failure classification returned by task handlers. The runner maps each
/// variant to a broker action: Critical is negatively acknowledged and
/// redelivered, NonCritical is rejected to the stash queue.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transient or infrastructure fault (store unreachable, broken
    /// invariant). Retrying can succeed once the fault is fixed.
    #[error("critical: {message}")]
    Critical {
        message: String,
        context: Option<Value>,
    },

    /// A task that will never succeed on retry (malformed payload, bad
    /// identifiers). Stashed for manual inspection instead of blocking the
    /// queue.
    #[error("non-critical: {message}")]
    NonCritical {
        message: String,
        context: Option<Value>,
    },
}

impl WorkerError {
    pub fn critical(message: impl Into<String>) -> Self {
        Self::Critical {
            message: message.into(),
            context: None,
        }
    }

    pub fn non_critical(message: impl Into<String>) -> Self {
        Self::NonCritical {
            message: message.into(),
            context: None,
        }
    }

    /// Attach free-form diagnostic context, kept alongside the message in
    /// logs.
    pub fn with_context(self, context: Value) -> Self {
        match self {
            Self::Critical { message, .. } => Self::Critical {
                message,
                context: Some(context),
            },
            Self::NonCritical { message, .. } => Self::NonCritical {
                message,
                context: Some(context),
            },
        }
    }

    pub fn context(&self) -> Option<&Value> {
        match self {
            Self::Critical { context, .. } | Self::NonCritical { context, .. } => context.as_ref(),
        }
    }
}

/// Errors publishing a follow-up task.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no queue registered for worker '{0}'")]
    UnknownWorker(String),
    #[error("failed to encode task payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
