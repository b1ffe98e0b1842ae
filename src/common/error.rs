//! Error types for the filter and its collaborators

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types organized by layer/domain.
///
/// The enum is `Clone` because the filter loop's terminal error is handed
/// out to every caller of `wait()`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────
    /// The unit has been removed or is dead; the caller should shut
    /// down this unit's worker as a normal termination.
    #[error("agent should be terminated")]
    TerminateAgent,

    /// Returned from request entry points when the filter is shutting
    /// down instead of blocking forever.
    #[error("event filter is shutting down")]
    Dying,

    // ─────────────────────────────────────────────────────────────
    // State Backend Errors
    // ─────────────────────────────────────────────────────────────
    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("service unexpectedly removed")]
    ServiceRemoved,

    #[error("service unexpectedly dead")]
    ServiceDead,

    #[error("state backend error: {message}")]
    Backend { message: String },

    // ─────────────────────────────────────────────────────────────
    // Watcher Errors
    // ─────────────────────────────────────────────────────────────
    #[error("watcher error: {message}")]
    Watcher { message: String },

    // ─────────────────────────────────────────────────────────────
    // Domain Errors
    // ─────────────────────────────────────────────────────────────
    #[error("invalid charm url: {url}")]
    InvalidCharmUrl { url: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn watcher(message: impl Into<String>) -> Self {
        Self::Watcher {
            message: message.into(),
        }
    }

    /// Check if this error means the requested entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is the normal-shutdown signal for the agent
    pub fn is_terminate_agent(&self) -> bool {
        matches!(self, Error::TerminateAgent)
    }

    /// Check if this error was caused by the filter shutting down
    pub fn is_dying(&self) -> bool {
        matches!(self, Error::Dying)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::not_found("unit wordpress/0");
        assert_eq!(err.to_string(), "unit wordpress/0 not found");

        let err = Error::backend("connection reset");
        assert_eq!(err.to_string(), "state backend error: connection reset");

        assert_eq!(
            Error::TerminateAgent.to_string(),
            "agent should be terminated"
        );
        assert_eq!(Error::ServiceRemoved.to_string(), "service unexpectedly removed");
    }

    #[test]
    fn test_error_is_not_found() {
        assert!(Error::not_found("unit x/0").is_not_found());
        assert!(!Error::backend("boom").is_not_found());
        assert!(!Error::TerminateAgent.is_not_found());
    }

    #[test]
    fn test_error_is_terminate_agent() {
        assert!(Error::TerminateAgent.is_terminate_agent());
        assert!(!Error::Dying.is_terminate_agent());
        assert!(!Error::ServiceDead.is_terminate_agent());
    }

    #[test]
    fn test_error_is_dying() {
        assert!(Error::Dying.is_dying());
        assert!(!Error::TerminateAgent.is_dying());
    }

    #[test]
    fn test_error_clone_keeps_message() {
        let err = Error::watcher("closed unexpectedly");
        let clone = err.clone();
        assert_eq!(err.to_string(), clone.to_string());
    }
}
