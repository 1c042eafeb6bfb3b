use crate::aggregator::CoverageError;
use crate::types::{Operation, TaskPhase, WindowTiming};
use crpc_economics::{LedgerError, TokenAmount};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrpcError>;

/// How a caller should react to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// The window for this call has not opened yet.
    RetryLater,
    /// The call can succeed now with corrected input (deadline not yet passed).
    RetryNow,
    /// The call can never succeed for this task.
    Permanent,
}

#[derive(Debug, Error)]
pub enum CrpcError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Phase violation: {operation:?} not allowed in {phase:?} ({timing:?})")]
    PhaseViolation {
        operation: Operation,
        phase: TaskPhase,
        timing: WindowTiming,
    },

    #[error("Commitment mismatch (reveal accepted until {deadline})")]
    CommitmentMismatch { deadline: u64 },

    /// The commitment already binds the malformed ballot, so no reveal can fix it.
    #[error("Incomplete pairwise coverage: {reason}")]
    IncompleteCoverage { reason: CoverageError },

    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds {
        needed: TokenAmount,
        available: TokenAmount,
    },

    #[error("Insufficient locked stake: requested {requested}, locked {locked}")]
    InsufficientLockedStake {
        requested: TokenAmount,
        locked: TokenAmount,
    },

    #[error("Beneficiary pool underflow: requested {requested}, available {available}")]
    PoolUnderflow {
        requested: TokenAmount,
        available: TokenAmount,
    },

    #[error("Invalid deadlines: {0}")]
    InvalidDeadlines(String),

    #[error("Invalid task input: {0}")]
    InvalidTaskInput(String),

    #[error("Submission not found: {0}")]
    SubmissionNotFound(u32),

    #[error("Comparison not found for validator {0}")]
    ComparisonNotFound(String),

    #[error("Caller is not the author of submission {0}")]
    NotAuthor(u32),

    #[error("Already revealed")]
    AlreadyRevealed,

    #[error("Commitment digest already used in this task")]
    DuplicateCommitment,

    #[error("Participant {0} already holds a commitment in this task")]
    AlreadySubmitted(String),

    #[error("Conflict of interest: {0}")]
    ConflictOfInterest(String),

    #[error("Validator not registered: {0}")]
    ValidatorNotRegistered(String),

    #[error("Validator already registered: {0}")]
    ValidatorAlreadyRegistered(String),

    #[error("Validator inactive: {0}")]
    ValidatorInactive(String),

    #[error("Validator {validator} has {open_commitments} unfinalized commitments")]
    ValidatorBusy {
        validator: String,
        open_commitments: u32,
    },

    #[error("Stake below minimum: required {required}, provided {provided}")]
    StakeBelowMinimum {
        required: TokenAmount,
        provided: TokenAmount,
    },

    #[error("Capacity exceeded: {resource} limit {limit}")]
    CapacityExceeded { resource: &'static str, limit: usize },

    #[error("Unsupported validation evidence: {0}")]
    UnsupportedEvidence(&'static str),

    #[error("Disputes are disabled (no resolver configured)")]
    DisputesDisabled,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Dispute already open for task")]
    DisputeAlreadyOpen,

    #[error("Task is not under dispute")]
    NotDisputed,

    #[error("Distribution frozen while dispute is pending")]
    DisputePending,

    #[error("Invalid ranking: {0}")]
    InvalidRanking(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Identity resolution failed: {0}")]
    IdentityResolution(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Ledger error: {0}")]
    Ledger(LedgerError),
}

impl From<LedgerError> for CrpcError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                needed, available, ..
            } => CrpcError::InsufficientFunds { needed, available },
            LedgerError::InsufficientLocked { needed, locked, .. } => {
                CrpcError::InsufficientLockedStake {
                    requested: needed,
                    locked,
                }
            }
            other => CrpcError::Ledger(other),
        }
    }
}

impl CrpcError {
    /// Classify the error for the caller at time `now`.
    pub fn retry_hint(&self, now: u64) -> RetryHint {
        match self {
            CrpcError::PhaseViolation { timing, .. } => match timing {
                WindowTiming::TooEarly { .. } => RetryHint::RetryLater,
                WindowTiming::TooLate { .. } | WindowTiming::WrongState => RetryHint::Permanent,
            },
            CrpcError::CommitmentMismatch { deadline } => {
                if now < *deadline {
                    RetryHint::RetryNow
                } else {
                    RetryHint::Permanent
                }
            }
            CrpcError::InsufficientFunds { .. } => RetryHint::RetryNow,
            CrpcError::DisputePending => RetryHint::RetryLater,
            _ => RetryHint::Permanent,
        }
    }
}
