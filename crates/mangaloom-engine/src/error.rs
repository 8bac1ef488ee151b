use mangaloom_contracts::PersistenceError;
use thiserror::Error;

use crate::retry::Ladder;

/// Terminal failure of one page render, after the relevant ladder gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("image provider still overloaded after {attempts} attempts (last reason: {reason})")]
    TransientExhausted { attempts: u32, reason: String },
    #[error("content policy block persisted after {attempts} attempts (last reason: {reason})")]
    PolicyExhausted { attempts: u32, reason: String },
    #[error("malformed provider response: {reason}")]
    MalformedResponse { reason: String },
    #[error("image provider call failed: {reason}")]
    Fatal { reason: String },
}

impl GenerationError {
    /// The ladder whose exhaustion caused this error, if any.
    pub fn ladder(&self) -> Option<Ladder> {
        match self {
            Self::TransientExhausted { .. } => Some(Ladder::Transient),
            Self::PolicyExhausted { .. } => Some(Ladder::PolicyBlock),
            Self::MalformedResponse { .. } | Self::Fatal { .. } => None,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::TransientExhausted { reason, .. }
            | Self::PolicyExhausted { reason, .. }
            | Self::MalformedResponse { reason }
            | Self::Fatal { reason } => reason,
        }
    }
}

/// Continuation text could not be produced. Always absorbed by a fallback prompt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptDerivationError {
    #[error("continuation request blocked: {reason}")]
    Blocked { reason: String },
    #[error("text provider still overloaded after {attempts} attempts: {reason}")]
    TransientExhausted { attempts: u32, reason: String },
    #[error("malformed text provider response: {reason}")]
    Malformed { reason: String },
    #[error("text provider call failed: {reason}")]
    Provider { reason: String },
    #[error("text provider returned an empty continuation")]
    Empty,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("a batch is already running for session '{session_id}'")]
    AlreadyRunning { session_id: String },
    #[error("invalid batch request: {reason}")]
    InvalidRequest { reason: String },
    #[error("failed to load session: {0}")]
    SessionLoad(#[from] PersistenceError),
    #[error("failed to start batch worker: {0}")]
    Spawn(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::GenerationError;
    use crate::retry::Ladder;

    #[test]
    fn generation_error_names_exhausted_ladder_and_reason() {
        let err = GenerationError::PolicyExhausted {
            attempts: 5,
            reason: "IMAGE_SAFETY".to_string(),
        };
        assert_eq!(err.ladder(), Some(Ladder::PolicyBlock));
        assert_eq!(err.reason(), "IMAGE_SAFETY");
        assert_eq!(
            err.to_string(),
            "content policy block persisted after 5 attempts (last reason: IMAGE_SAFETY)"
        );

        let malformed = GenerationError::MalformedResponse {
            reason: "no image".to_string(),
        };
        assert_eq!(malformed.ladder(), None);
    }
}
