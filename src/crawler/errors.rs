use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;

use crate::modes::document::SchemaError;
use crate::modes::registry::RegistryError;
use crate::net::RequestError;
use crate::proxy::InterceptorError;
use crate::storage::StoreError;

/// Coarse category of a handler failure, used by [`FailurePolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Browser process or WebDriver session is gone
    Browser,
    /// Interceptor proxy could not start or died
    Interceptor,
    /// HTTP call failed (including exhausted retries)
    Request,
    /// Record did not match its schema
    Schema,
    /// Page-level problem: navigation failed, element missing, script error
    Page,
    /// Anything else raised by handler code
    Handler,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Browser => "browser",
            ErrorKind::Interceptor => "interceptor",
            ErrorKind::Request => "request",
            ErrorKind::Schema => "schema",
            ErrorKind::Page => "page",
            ErrorKind::Handler => "handler",
        };
        f.write_str(name)
    }
}

/// Error returned by mode handlers and the capabilities they call
#[derive(Debug, thiserror::Error)]
pub enum ModeError {
    #[error("browser failure: {0}")]
    Browser(String),

    #[error(transparent)]
    Interceptor(#[from] InterceptorError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("page error: {0}")]
    Page(String),

    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl ModeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModeError::Browser(_) => ErrorKind::Browser,
            ModeError::Interceptor(_) => ErrorKind::Interceptor,
            ModeError::Request(_) => ErrorKind::Request,
            ModeError::Schema(_) => ErrorKind::Schema,
            ModeError::Page(_) => ErrorKind::Page,
            ModeError::Handler(_) => ErrorKind::Handler,
        }
    }

    pub fn page(message: impl Into<String>) -> Self {
        ModeError::Page(message.into())
    }

    /// Handler error carrying the message of a caught panic
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        ModeError::Handler(anyhow::anyhow!("handler panicked: {}", message))
    }
}

/// Which error kinds abort the whole run instead of just the current record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    fatal: HashSet<ErrorKind>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::new([ErrorKind::Browser, ErrorKind::Interceptor])
    }
}

impl FailurePolicy {
    pub fn new(fatal: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            fatal: fatal.into_iter().collect(),
        }
    }

    pub fn is_fatal(&self, error: &ModeError) -> bool {
        self.fatal.contains(&error.kind())
    }
}

/// Errors surfaced to the caller of the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Mode lookup or chain validation failed before any record was processed
    #[error(transparent)]
    Config(#[from] RegistryError),

    /// The output file could not be written
    #[error("failed to persist output of mode '{mode}': {source}")]
    Persist {
        mode: String,
        #[source]
        source: StoreError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_only_aborts_on_session_loss() {
        let policy = FailurePolicy::default();

        assert!(policy.is_fatal(&ModeError::Browser("chrome not reachable".into())));
        assert!(!policy.is_fatal(&ModeError::page("element not found")));
        assert!(!policy.is_fatal(&ModeError::Handler(anyhow::anyhow!("boom"))));
    }

    #[test]
    fn test_panic_payload_becomes_handler_error() {
        let payload = std::panic::catch_unwind(|| panic!("index {} out of range", 3)).unwrap_err();
        let error = ModeError::from_panic(payload);

        assert_eq!(error.kind(), ErrorKind::Handler);
        assert_eq!(error.to_string(), "handler panicked: index 3 out of range");
        assert!(!FailurePolicy::default().is_fatal(&error));
        assert_eq!(
            ModeError::from_panic(Box::new(7_u8)).to_string(),
            "handler panicked: unknown panic"
        );
    }

    #[test]
    fn test_policy_can_escalate_request_errors() {
        let policy = FailurePolicy::new([ErrorKind::Request]);
        let error = ModeError::Request(RequestError::InvalidUrl {
            url: "::".into(),
            reason: "relative URL without a base".into(),
        });

        assert!(policy.is_fatal(&error));
        assert!(!policy.is_fatal(&ModeError::Browser("gone".into())));
    }
}
