//! Error types for the harness core.
//!
//! | Type             | Raised by                         | Fatal to             |
//! |------------------|-----------------------------------|----------------------|
//! | `ConfigError`    | resolver / config store           | the resolution call  |
//! | `ProtocolError`  | wire codec and request clients    | the request          |
//! | `PlatformError`  | middleware collaborator           | the admin operation  |
//! | `TestException`  | every component boundary          | the current test     |
//!
//! Cleanup paths never propagate; they go through [`best_effort`], which logs
//! and discards the failure so sibling resources still get torn down.

use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Boxed cause carried by [`TestException`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the core.
pub type Result<T, E = TestException> = std::result::Result<T, E>;

/// Configuration resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Malformed substitution syntax.
    #[error("format error in '{input}' at offset {offset}: {reason}")]
    Format {
        input: String,
        offset: usize,
        reason: String,
    },

    /// A `<file:...>` or `<url:...>` token could not be located.
    #[error("{kind} not found: {path}")]
    NotFound { kind: &'static str, path: String },

    /// Self-referencing lookups did not converge.
    #[error("resolution of '{key}' exceeded the maximum nesting depth")]
    Recursion { key: String },
}

impl ConfigError {
    pub(crate) fn format(input: &str, offset: usize, reason: impl Into<String>) -> Self {
        Self::Format {
            input: input.to_string(),
            offset,
            reason: reason.into(),
        }
    }
}

/// Wire protocol failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unsupported protocol version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("remote side reported: {0}")]
    Remote(String),

    #[error("no reply received")]
    NoReply,
}

/// Failures reported by the middleware platform collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The referenced service or group is not registered (already gone).
    #[error("not found: {0}")]
    NotFound(String),

    /// Activation-system specific failure.
    #[error("activation failure: {0}")]
    Activation(String),

    #[error("{0}")]
    Other(String),
}

/// Universal failure type crossing component boundaries.
#[derive(Debug)]
pub struct TestException {
    message: String,
    source: Option<BoxError>,
}

impl TestException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Walk the cause chain looking for an error of type `E`.
    pub fn find_cause<E: StdError + 'static>(&self) -> Option<&E> {
        let mut current: Option<&(dyn StdError + 'static)> = self
            .source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static));
        while let Some(err) = current {
            if let Some(found) = err.downcast_ref::<E>() {
                return Some(found);
            }
            current = err.source();
        }
        None
    }

    /// Message plus every cause, joined with `: `.
    pub fn chain_message(&self) -> String {
        let mut out = self.message.clone();
        let mut current = self.source();
        while let Some(err) = current {
            out.push_str(": ");
            out.push_str(&err.to_string());
            current = err.source();
        }
        out
    }
}

impl fmt::Display for TestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for TestException {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<ConfigError> for TestException {
    fn from(err: ConfigError) -> Self {
        Self::with_cause("configuration resolution failed", err)
    }
}

impl From<ProtocolError> for TestException {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Remote(message) => Self::new(message),
            other => Self::with_cause("communication failure", other),
        }
    }
}

impl From<PlatformError> for TestException {
    fn from(err: PlatformError) -> Self {
        Self::with_cause("platform operation failed", err)
    }
}

impl From<std::io::Error> for TestException {
    fn from(err: std::io::Error) -> Self {
        Self::with_cause("I/O failure", err)
    }
}

/// Log-and-continue channel for teardown paths.
///
/// Returns `true` when the operation succeeded.
pub fn best_effort<T, E: fmt::Display>(label: &str, result: std::result::Result<T, E>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => {
            warn!(operation = label, error = %err, "cleanup step failed; continuing");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_message_includes_causes() {
        let err = TestException::with_cause(
            "service start failed",
            ConfigError::NotFound {
                kind: "file",
                path: "policy.all".to_string(),
            },
        );
        assert_eq!(
            err.chain_message(),
            "service start failed: file not found: policy.all"
        );
    }

    #[test]
    fn test_find_cause_walks_nested_chain() {
        let inner = TestException::with_cause("inner", PlatformError::NotFound("svc".into()));
        let outer = TestException::with_cause("outer", inner);
        assert_eq!(
            outer.find_cause::<PlatformError>(),
            Some(&PlatformError::NotFound("svc".into()))
        );
        assert!(outer.find_cause::<ConfigError>().is_none());
    }

    #[test]
    fn test_remote_protocol_error_keeps_message() {
        let err: TestException = ProtocolError::Remote("no such service".into()).into();
        assert_eq!(err.message(), "no such service");
    }

    #[test]
    fn test_best_effort_reports_outcome() {
        assert!(best_effort::<(), String>("ok", Ok(())));
        assert!(!best_effort::<(), String>("boom", Err("failed".into())));
    }
}
