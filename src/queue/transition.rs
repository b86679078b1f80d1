//! The single place where per-item outcomes become queue transitions.

use crate::error::{ErrorKind, FetchError};

use super::types::WorkStatus;

/// What to do with a claimed item once its fetch has resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Complete,
    Skip { reason: String },
    Fail { kind: ErrorKind, message: String },
}

impl Transition {
    /// Map a fetch result to a transition.
    ///
    /// `Ok(Some(_))` completes, `Ok(None)` means the upstream had no data for
    /// the item and skips it, and any error fails it with the error's kind.
    pub fn from_outcome<T>(outcome: &Result<Option<T>, FetchError>) -> Self {
        match outcome {
            Ok(Some(_)) => Transition::Complete,
            Ok(None) => Transition::Skip {
                reason: "no data returned for item".to_string(),
            },
            Err(err) => Transition::from_error(err),
        }
    }

    pub fn from_error(err: &FetchError) -> Self {
        Transition::Fail {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn target_status(&self) -> WorkStatus {
        match self {
            Transition::Complete => WorkStatus::Completed,
            Transition::Skip { .. } => WorkStatus::Skipped,
            Transition::Fail { .. } => WorkStatus::Failed,
        }
    }

    /// Whether a failed item may later be requeued.
    pub fn retryable(&self) -> bool {
        match self {
            Transition::Fail { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Transition::Complete => "completed",
            Transition::Skip { .. } => "skipped",
            Transition::Fail { kind, .. } => match kind {
                ErrorKind::Transient => "failed_transient",
                ErrorKind::Permanent => "failed_permanent",
                ErrorKind::Parse => "failed_parse",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_success_completes() {
        let outcome: Result<Option<u8>, FetchError> = Ok(Some(1));
        assert_eq!(Transition::from_outcome(&outcome), Transition::Complete);
    }

    #[test]
    fn test_empty_response_skips() {
        let outcome: Result<Option<u8>, FetchError> = Ok(None);
        let transition = Transition::from_outcome(&outcome);
        assert_eq!(transition.target_status(), WorkStatus::Skipped);
        assert!(!transition.retryable());
    }

    #[test]
    fn test_failures_carry_kind() {
        let timeout: Result<Option<u8>, FetchError> =
            Err(FetchError::Timeout(Duration::from_secs(30)));
        let transition = Transition::from_outcome(&timeout);
        assert_eq!(transition.target_status(), WorkStatus::Failed);
        assert!(transition.retryable());
        assert_eq!(transition.label(), "failed_transient");

        let parse: Result<Option<u8>, FetchError> = Err(FetchError::Parse("bad".into()));
        let transition = Transition::from_outcome(&parse);
        assert!(!transition.retryable());
        assert_eq!(transition.label(), "failed_parse");

        let missing = Transition::from_error(&FetchError::NotFound);
        assert!(matches!(
            missing,
            Transition::Fail {
                kind: ErrorKind::Permanent,
                ..
            }
        ));
    }
}
