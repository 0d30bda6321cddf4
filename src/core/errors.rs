use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the distributed pool
///
/// Every variant is cheap to clone so an async handle can return the same
/// captured failure from repeated `get` calls.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The caller used an object in a way its lifecycle does not allow
    #[error("Usage error: {message}")]
    Usage { message: String },

    /// An object was asked to change state while in the wrong state
    #[error("State error in {component}: {message}")]
    State { component: String, message: String },

    /// Arguments had the wrong shape
    #[error("Type error: {message}")]
    Type { message: String },

    /// User code failed on an executor
    #[error(transparent)]
    Remote(RemoteError),

    /// A bounded wait expired before the call finished
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A channel was closed on purpose while someone was waiting on it
    #[error("Shutdown: {component} was closed")]
    Shutdown { component: String },

    /// Channel/messaging errors
    #[error("Channel error: {channel} - {message}")]
    Channel { channel: String, message: String },

    /// Network/IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Serialization errors
    #[error("Serialization failed ({format}): {message}")]
    Serialization { format: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A packet referenced a callable nobody registered
    #[error("Function not registered: {name}")]
    FunctionNotFound { name: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PoolError {
    pub fn usage<S: Into<String>>(message: S) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn state<C: Into<String>, S: Into<String>>(component: C, message: S) -> Self {
        Self::State {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn type_error<S: Into<String>>(message: S) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn shutdown<S: Into<String>>(component: S) -> Self {
        Self::Shutdown {
            component: component.into(),
        }
    }

    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source: Arc::new(source),
        }
    }

    pub fn serialization<S: Into<String>, M: fmt::Display>(format: S, message: M) -> Self {
        Self::Serialization {
            format: format.into(),
            message: message.to_string(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the error only signals an intentional close
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage { .. } | Self::State { .. } | Self::Type { .. })
    }

    /// The remote failure, if user code raised this error
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RemoteError> for PoolError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for PoolError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

/// Category of a failure raised on an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The user function returned an error
    User,
    /// The user function panicked
    Panic,
    /// The initializer of the worker failed
    Initializer,
    /// The packet named a function the executor does not know
    UnknownFunction,
    /// A chunk element could not be turned into an argument list
    BadArguments,
    /// The local pool went away mid-chunk
    Pool,
    /// The chunk's outputs did not fit in one frame
    Oversize,
}

/// Serializable descriptor of a failure raised on an executor
///
/// This travels inside a `ResultPacket` in place of the chunk's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?} error in remote function '{function}': {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub function: String,
    pub message: String,
    /// Position of the failing element inside its chunk, when known
    pub index: Option<usize>,
}

impl RemoteError {
    pub fn new<F: Into<String>, M: Into<String>>(
        kind: RemoteErrorKind,
        function: F,
        message: M,
    ) -> Self {
        Self {
            kind,
            function: function.into(),
            message: message.into(),
            index: None,
        }
    }

    pub fn user<F: Into<String>>(function: F, err: &anyhow::Error) -> Self {
        // `{:#}` keeps the whole anyhow context chain on one line
        Self::new(RemoteErrorKind::User, function, format!("{:#}", err))
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_keeps_context_chain() {
        let err = anyhow::anyhow!("division by zero").context("evaluating chunk");
        let remote = RemoteError::user("divide", &err).at(3);
        assert_eq!(remote.kind, RemoteErrorKind::User);
        assert_eq!(remote.index, Some(3));
        assert!(remote.message.contains("evaluating chunk"));
        assert!(remote.message.contains("division by zero"));
    }

    #[test]
    fn predicates() {
        assert!(PoolError::shutdown("coordinator").is_shutdown());
        assert!(PoolError::timeout("get", Duration::from_millis(5)).is_timeout());
        assert!(PoolError::usage("closed").is_usage());
        assert!(PoolError::type_error("not a list").is_usage());
        let remote: PoolError = RemoteError::new(RemoteErrorKind::Panic, "f", "boom").into();
        assert!(remote.as_remote().is_some());
        assert!(!remote.is_usage());
    }

    #[test]
    fn timeout_reports_millis() {
        let err = PoolError::timeout("wait", Duration::from_secs(2));
        assert_eq!(
            err.to_string(),
            "Operation timed out: wait (timeout: 2000ms)"
        );
    }
}
