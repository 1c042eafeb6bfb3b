//! Commit-reveal pairwise comparison protocol.
//!
//! Authors commit to work artifacts and reveal them; staked validators then
//! commit to and reveal a complete set of pairwise judgments over the revealed
//! artifacts. The judgments are aggregated into a ranking, and the reward pool
//! plus forfeited stakes are distributed from it.

pub mod aggregator;
pub mod commitment;
pub mod config;
pub mod disputes;
pub mod error;
pub mod identity;
pub mod logging;
pub mod registry;
pub mod reputation;
pub mod rewards;
pub mod stake;
pub mod task_manager;
pub mod types;

pub use aggregator::{required_pairs, Aggregator, CoverageError, RankEntry, Ranking};
pub use commitment::{
    comparison_commitment, encode_comparison_payload, encode_work_payload, work_commitment,
};
pub use config::{
    AccountsConfig, DisputeConfig, LimitsConfig, LoggingConfig, ProtocolConfig, RewardsConfig,
    StakeConfig,
};
pub use disputes::DisputeResolution;
pub use error::{CrpcError, Result, RetryHint};
pub use identity::{DerivedIdentityResolver, IdentityResolver, StaticIdentityResolver};
pub use logging::init_logging;
pub use registry::{ValidatorRegistration, ValidatorRegistry};
pub use reputation::{
    ChannelReputationSink, NoopReputationSink, ReputationEvent, ReputationOutcome, ReputationSink,
    SinkError,
};
pub use stake::{BeneficiaryPool, PoolKind, StakeLedger, StakeOp, StakeScope};
pub use task_manager::TaskManager;
pub use types::*;

pub use crpc_economics::{BalanceManager, TokenAmount, TokenLedger};
pub use crpc_types::{AgentId, Hash, SubmissionIndex, TaskId};
