//! Error types for the BitCraps consensus layer
//!
//! Every public operation returns an explicit [`Result`]. Rejections of a single
//! vote, proposal or snapshot are ordinary error values that callers log and
//! drop; only systemic failures (state that cannot be serialized, a transport
//! that cannot be reached) are meant to travel further up.

use thiserror::Error;

/// Result type alias for consensus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network and transport layer errors
    Network,
    /// Cryptographic and signature errors
    Security,
    /// Consensus protocol errors
    Consensus,
    /// Game rule and balance errors
    Gaming,
    /// Configuration and setup errors
    Configuration,
    /// Resource exhaustion errors
    Resources,
    /// Internal system errors
    Internal,
    /// Caller input validation errors
    Validation,
}

impl ErrorCategory {
    /// Get the monitoring severity level for this category
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Security | Self::Consensus => ErrorSeverity::Critical,
            Self::Network | Self::Internal => ErrorSeverity::High,
            Self::Gaming | Self::Resources => ErrorSeverity::Medium,
            Self::Validation | Self::Configuration => ErrorSeverity::Low,
        }
    }

    /// Get the recommended retry strategy for this category
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Network => RetryStrategy::ExponentialBackoff { max_retries: 3 },
            Self::Resources => RetryStrategy::LinearBackoff { max_retries: 5 },
            Self::Validation | Self::Security | Self::Configuration => RetryStrategy::NoRetry,
            _ => RetryStrategy::LinearBackoff { max_retries: 1 },
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Retry strategies for error recovery
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    NoRetry,
    LinearBackoff { max_retries: u32 },
    ExponentialBackoff { max_retries: u32 },
}

/// Consensus error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Operation submission
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Sequence conflict: {0}")]
    SequenceConflict(String),

    #[error("Game frozen: {0}")]
    GameFrozen(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Arithmetic overflow: {0}")]
    ArithmeticOverflow(String),

    // Byzantine Fault Tolerance errors
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Unknown proposal: {0}")]
    UnknownProposal(String),

    #[error("Duplicate vote: {0}")]
    DuplicateVote(String),

    #[error("Insufficient votes: {0}")]
    InsufficientVotes(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Consensus timeout: {0}")]
    ConsensusTimeout(String),

    // Commit-reveal randomness
    #[error("Invalid reveal: {0}")]
    InvalidReveal(String),

    #[error("Randomness error: {0}")]
    Randomness(String),

    // Disputes and state sync
    #[error("Dispute not found: {0}")]
    DisputeNotFound(String),

    #[error("Dispute expired: {0}")]
    DisputeExpired(String),

    #[error("State checksum mismatch: {0}")]
    StateChecksumMismatch(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl Error {
    /// Get a stable error code for telemetry
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "E001",
            Self::Serialization(_) => "E002",
            Self::Bincode(_) => "E004",
            Self::Crypto(_) => "E005",
            Self::Protocol(_) => "E006",
            Self::Network(_) => "E007",
            Self::Transport(_) => "E009",
            Self::InsufficientBalance(_) => "E015",
            Self::InvalidSignature(_) => "E017",
            Self::InvalidState(_) => "E020",
            Self::Config(_) => "E024",
            Self::InvalidProposal(_) => "E030",
            Self::DuplicateVote(_) => "E031",
            Self::InsufficientVotes(_) => "E032",
            Self::UnknownPeer(_) => "E033",
            Self::ArithmeticOverflow(_) => "E034",
            Self::ResourceExhausted(_) => "E048",
            Self::InvalidOperation(_) => "E052",
            Self::ConsensusTimeout(_) => "E058",
            Self::SequenceConflict(_) => "E065",
            Self::GameFrozen(_) => "E066",
            Self::UnknownProposal(_) => "E067",
            Self::InvalidReveal(_) => "E068",
            Self::Randomness(_) => "E069",
            Self::DisputeNotFound(_) => "E070",
            Self::DisputeExpired(_) => "E071",
            Self::StateChecksumMismatch(_) => "E072",
        }
    }

    /// Get the error category for monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::Serialization(_) | Self::Bincode(_) | Self::InvalidState(_) => {
                ErrorCategory::Internal
            }
            Self::Crypto(_) | Self::InvalidSignature(_) | Self::InvalidReveal(_) => {
                ErrorCategory::Security
            }
            Self::Protocol(_) | Self::Network(_) | Self::Transport(_) | Self::UnknownPeer(_) => {
                ErrorCategory::Network
            }
            Self::InsufficientBalance(_) | Self::GameFrozen(_) => ErrorCategory::Gaming,
            Self::ResourceExhausted(_) | Self::ArithmeticOverflow(_) => ErrorCategory::Resources,
            Self::InvalidProposal(_)
            | Self::UnknownProposal(_)
            | Self::DuplicateVote(_)
            | Self::InsufficientVotes(_)
            | Self::SequenceConflict(_)
            | Self::ConsensusTimeout(_)
            | Self::Randomness(_)
            | Self::DisputeNotFound(_)
            | Self::DisputeExpired(_)
            | Self::StateChecksumMismatch(_) => ErrorCategory::Consensus,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::InvalidOperation(_) => ErrorCategory::Validation,
        }
    }

    /// Get the error severity for alerting
    pub fn severity(&self) -> ErrorSeverity {
        self.category().severity()
    }

    /// Get the recommended retry strategy
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            // Resubmitting against the current state is the expected recovery
            Self::SequenceConflict(_) | Self::ConsensusTimeout(_) => {
                RetryStrategy::LinearBackoff { max_retries: 3 }
            }
            Self::DuplicateVote(_) | Self::InvalidProposal(_) | Self::StateChecksumMismatch(_) => {
                RetryStrategy::NoRetry
            }
            _ => self.category().retry_strategy(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.retry_strategy(), RetryStrategy::NoRetry)
    }

    /// Create a consensus timeout error for a proposal
    pub fn consensus_timeout(proposal: impl Into<String>, timeout_ms: u128) -> Self {
        Error::ConsensusTimeout(format!(
            "proposal {} did not reach consensus within {}ms",
            proposal.into(),
            timeout_ms
        ))
    }

    /// Create an insufficient balance error with structured context
    pub fn insufficient_balance_for(operation: impl Into<String>, required: u64, available: u64) -> Self {
        Error::InsufficientBalance(format!(
            "Insufficient balance for {}: required {}, available {}",
            operation.into(),
            required,
            available
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::Network("test".to_string());
        assert_eq!(err.code(), "E007");
        assert_eq!(err.category(), ErrorCategory::Network);

        let err = Error::SequenceConflict("stale".to_string());
        assert_eq!(err.code(), "E065");
        assert_eq!(err.category(), ErrorCategory::Consensus);
    }

    #[test]
    fn test_error_severity() {
        let err = Error::InvalidSignature("bad vote".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Critical);

        let err = Error::InvalidOperation("zero bet".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_retry_strategy() {
        assert!(Error::SequenceConflict("stale base".to_string()).is_retryable());
        assert!(Error::consensus_timeout("ab12", 30_000).is_retryable());
        assert!(!Error::DuplicateVote("twice".to_string()).is_retryable());
        assert!(!Error::InvalidOperation("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_helper_functions() {
        let err = Error::consensus_timeout("deadbeef", 30_000);
        assert!(matches!(err, Error::ConsensusTimeout(_)));
        assert!(err.to_string().contains("30000ms"));

        let err = Error::insufficient_balance_for("bet", 100, 50);
        assert!(matches!(err, Error::InsufficientBalance(_)));
    }
}
