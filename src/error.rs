//! Error taxonomy for the optimization loop.
//!
//! Every class except [`RevertInconsistencyError`] is recovered locally:
//! the iteration is marked skipped or failed and the loop continues.
//! `RevertInconsistencyError` means the working tree can no longer be
//! trusted to match version control, so the loop must halt.

use std::fmt;

/// The external patch service could not be reached or returned garbage.
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub message: String,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch service error: {}", self.message)
    }
}

impl std::error::Error for ServiceError {}

/// No usable patch could be produced within the attempt budget.
#[derive(Debug, Clone)]
pub struct GenerationError {
    pub message: String,
    pub attempts: usize,
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "patch generation failed after {} attempt(s): {}",
            self.attempts, self.message
        )
    }
}

impl std::error::Error for GenerationError {}

/// A `find` string from a JSON edits payload was not present in the target file.
#[derive(Debug, Clone)]
pub struct EditNotFoundError {
    pub path: String,
    pub find: String,
}

impl fmt::Display for EditNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "edit target not found in {}: {:?}",
            self.path,
            crate::util::truncate(&self.find, 80)
        )
    }
}

impl std::error::Error for EditNotFoundError {}

/// An edit path escaped the permitted root (absolute or parent traversal).
#[derive(Debug, Clone)]
pub struct EditPathError {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for EditPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edit path {} rejected: {}", self.path, self.reason)
    }
}

impl std::error::Error for EditPathError {}

/// The diff failed the dry-run check against the current tree.
#[derive(Debug, Clone)]
pub struct ApplyCheckError {
    pub message: String,
}

impl fmt::Display for ApplyCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch does not apply cleanly: {}", self.message)
    }
}

impl std::error::Error for ApplyCheckError {}

/// A measurement phase could not produce any sample.
#[derive(Debug, Clone)]
pub struct MeasurementError {
    pub message: String,
}

impl fmt::Display for MeasurementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "measurement failed: {}", self.message)
    }
}

impl std::error::Error for MeasurementError {}

/// Reverse-applying a previously applied diff failed. Fatal: the tree's
/// relationship to version control is unknown from this point on.
#[derive(Debug, Clone)]
pub struct RevertInconsistencyError {
    pub message: String,
}

impl fmt::Display for RevertInconsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "revert failed, working tree state is untrusted: {}",
            self.message
        )
    }
}

impl std::error::Error for RevertInconsistencyError {}

/// Invalid or inconsistent configuration.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_is_downcastable() {
        let err: anyhow::Error = RevertInconsistencyError {
            message: "git apply -R exited 1".to_string(),
        }
        .into();
        assert!(err.downcast_ref::<RevertInconsistencyError>().is_some());
        assert!(err.downcast_ref::<ApplyCheckError>().is_none());
    }

    #[test]
    fn test_display_carries_context() {
        let err = GenerationError {
            message: "no diff in response".to_string(),
            attempts: 3,
        };
        let text = err.to_string();
        assert!(text.contains("3 attempt"));
        assert!(text.contains("no diff in response"));
    }
}
