//! Error types for E2E flows

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    /// A precondition of the whole flow failed (API down, tooling missing).
    /// Aborts the flow.
    #[error("Prerequisite failed: {0}")]
    FatalPrerequisite(String),

    #[error("Step failed: {step} - {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{driver} driver: {operation} '{target}' failed: {message}")]
    Driver {
        driver: &'static str,
        operation: String,
        target: String,
        message: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{operation} failed with HTTP {status}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Operation failed after {attempts} attempt(s): {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<E2eError>,
    },

    #[error("Circuit open: refusing call for another {remaining_ms} ms")]
    CircuitOpen { remaining_ms: u64 },

    #[error("Maestro not found ({0}). Install with: curl -Ls https://get.maestro.mobile.dev | bash")]
    MaestroNotFound(String),

    #[error("Playwright bridge error: {0}")]
    Playwright(String),

    #[error("Flow cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    /// Whether this error must abort the flow instead of failing a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            E2eError::FatalPrerequisite(_) | E2eError::Cancelled
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            E2eError::Timeout(_) => true,
            E2eError::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    pub(crate) fn driver(
        driver: &'static str,
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        E2eError::Driver {
            driver,
            operation: operation.into(),
            target: target.into(),
            message: message.to_string(),
        }
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_resource() {
        let err = E2eError::NotFound {
            kind: "Restaurant",
            id: "42".to_string(),
        };
        assert_eq!(err.to_string(), "Restaurant 42 not found");
    }

    #[test]
    fn test_retry_exhausted_includes_last_error() {
        let err = E2eError::RetryExhausted {
            attempts: 3,
            last: Box::new(E2eError::Timeout("health check".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("health check"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(E2eError::FatalPrerequisite("api down".into()).is_fatal());
        assert!(!E2eError::Timeout("poll".into()).is_fatal());
        assert!(!E2eError::driver("web", "click", "#accept", "detached").is_fatal());
        // Only fatal once raised as a prerequisite
        assert!(!E2eError::MaestroNotFound("maestro".into()).is_fatal());
    }
}
