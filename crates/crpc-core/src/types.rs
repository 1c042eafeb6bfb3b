use crate::config::ProtocolConfig;
use crpc_economics::TokenAmount;
use crpc_types::{AgentId, Hash, SubmissionIndex, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate scores are fixed-point with two decimal places: a win is worth
/// `SCORE_SCALE`, a tie half of it.
pub const SCORE_SCALE: u64 = 100;

/// Absolute upper bound on submissions per task. Coverage requires N(N-1)/2
/// judgments per validator, so this bounds reveal cost at 190 pairs.
pub const MAX_SUBMISSIONS_HARD_CAP: usize = 20;

/// Absolute upper bound on validators per task.
pub const MAX_VALIDATORS_HARD_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPhase {
    Created,              // Recorded, reward pool not yet locked
    AcceptingWork,        // Work commitments open
    WorkReveal,           // Authors reveal artifacts
    AcceptingComparisons, // Validator commitments open
    ComparisonReveal,     // Validators reveal judgments, then awaiting finalize
    Finalized,            // Distribution done
    Cancelled,            // No submissions by the work deadline
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Finalized | TaskPhase::Cancelled)
    }

    fn ordinal(&self) -> u8 {
        match self {
            TaskPhase::Created => 0,
            TaskPhase::AcceptingWork => 1,
            TaskPhase::WorkReveal => 2,
            TaskPhase::AcceptingComparisons => 3,
            TaskPhase::ComparisonReveal => 4,
            TaskPhase::Finalized => 5,
            TaskPhase::Cancelled => 6,
        }
    }

    /// Phases only move forward. A lazily synced task may skip intermediate
    /// windows when no call landed in them.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use TaskPhase::*;
        match (self, next) {
            (Finalized, _) | (Cancelled, _) => false,
            (_, Created) => false,
            (Created, AcceptingWork) => true,
            (Created, _) => false,
            (AcceptingWork, Cancelled) | (WorkReveal, Cancelled) => true,
            (_, Cancelled) => false,
            (ComparisonReveal, Finalized) => true,
            (_, Finalized) => false,
            (current, next) => next.ordinal() > current.ordinal(),
        }
    }
}

/// The call kinds gated by the phase windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    SubmitWork,
    RevealWork,
    SubmitComparison,
    RevealComparison,
    Finalize,
    Cancel,
    Dispute,
}

/// Why a call fell outside its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowTiming {
    TooEarly { opens_at: u64 },
    TooLate { closed_at: u64 },
    WrongState,
}

/// Strictly increasing phase boundaries, in caller-supplied time units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadlines {
    pub work: u64,
    pub reveal: u64,
    pub comparison: u64,
    pub finalize: u64,
}

impl Deadlines {
    pub fn new(work: u64, reveal: u64, comparison: u64, finalize: u64) -> Self {
        Self {
            work,
            reveal,
            comparison,
            finalize,
        }
    }

    pub fn validate(&self, now: u64) -> std::result::Result<(), String> {
        if now >= self.work {
            return Err(format!("work deadline {} is not after now {}", self.work, now));
        }
        if !(self.work < self.reveal && self.reveal < self.comparison && self.comparison < self.finalize)
        {
            return Err(format!(
                "deadlines must be strictly increasing: work={} reveal={} comparison={} final={}",
                self.work, self.reveal, self.comparison, self.finalize
            ));
        }
        Ok(())
    }

    /// Half-open `[start, end)` window for an operation. `None` means unbounded.
    pub fn window(&self, operation: Operation) -> (Option<u64>, Option<u64>) {
        match operation {
            Operation::SubmitWork => (None, Some(self.work)),
            Operation::RevealWork => (Some(self.work), Some(self.reveal)),
            Operation::SubmitComparison => (Some(self.reveal), Some(self.comparison)),
            Operation::RevealComparison => (Some(self.comparison), Some(self.finalize)),
            Operation::Finalize => (Some(self.finalize), None),
            Operation::Cancel => (Some(self.work), None),
            Operation::Dispute => (Some(self.reveal), None),
        }
    }

    pub fn timing(&self, operation: Operation, now: u64) -> Option<WindowTiming> {
        let (start, end) = self.window(operation);
        if let Some(start) = start {
            if now < start {
                return Some(WindowTiming::TooEarly { opens_at: start });
            }
        }
        if let Some(end) = end {
            if now >= end {
                return Some(WindowTiming::TooLate { closed_at: end });
            }
        }
        None
    }
}

/// Protocol parameters frozen into a task at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    pub submission_stake: TokenAmount,
    pub validator_stake: TokenAmount,
    pub max_submissions: usize,
    pub max_validators: usize,
    pub winner_share_bps: u16,
}

impl TaskParams {
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self {
            submission_stake: config.stakes.submission_stake,
            validator_stake: config.stakes.validator_task_stake,
            max_submissions: config.limits.max_submissions,
            max_validators: config.limits.max_validators,
            winner_share_bps: config.rewards.winner_share_bps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub raised_by: AgentId,
    pub reason: String,
    pub raised_at: u64,
    pub status: DisputeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub requester: AgentId,
    pub reward_pool: TokenAmount,
    pub description: String,
    pub phase: TaskPhase,
    pub deadlines: Deadlines,
    pub params: TaskParams,
    pub submission_count: u32,
    pub validator_count: u32,
    pub created_at: u64,
    pub dispute: Option<DisputeRecord>,
}

impl Task {
    /// Phase implied by the clock. Terminal phases are sticky.
    pub fn phase_at(&self, now: u64) -> TaskPhase {
        if self.phase.is_terminal() || self.phase == TaskPhase::Created {
            return self.phase;
        }
        let d = &self.deadlines;
        if now < d.work {
            TaskPhase::AcceptingWork
        } else if now < d.reveal {
            TaskPhase::WorkReveal
        } else if now < d.comparison {
            TaskPhase::AcceptingComparisons
        } else {
            TaskPhase::ComparisonReveal
        }
    }

    /// Advance the stored phase to match the clock.
    pub fn sync_phase(&mut self, now: u64) {
        let next = self.phase_at(now);
        if self.phase.can_transition_to(&next) {
            self.phase = next;
        }
    }

    pub fn is_dispute_open(&self) -> bool {
        matches!(
            self.dispute,
            Some(DisputeRecord {
                status: DisputeStatus::Open,
                ..
            })
        )
    }

    /// No work arrived before the work deadline.
    pub fn is_abandoned(&self, now: u64) -> bool {
        self.submission_count == 0 && now >= self.deadlines.work
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSubmission {
    pub index: SubmissionIndex,
    pub author: AgentId,
    pub commitment: Hash,
    pub artifact_ref: Option<String>,
    pub revealed: bool,
    pub stake: TokenAmount,
    pub committed_at: u64,
    pub revealed_at: Option<u64>,
    /// Total score across valid ballots, set at finalize.
    pub score: u64,
    /// 1-based rank, set at finalize for revealed submissions.
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    AWins,
    BWins,
    Tie,
}

impl Outcome {
    pub fn tag(&self) -> u8 {
        match self {
            Outcome::AWins => 0,
            Outcome::BWins => 1,
            Outcome::Tie => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairwiseJudgment {
    pub a: SubmissionIndex,
    pub b: SubmissionIndex,
    pub outcome: Outcome,
}

impl PairwiseJudgment {
    pub fn new(a: SubmissionIndex, b: SubmissionIndex, outcome: Outcome) -> Self {
        Self { a, b, outcome }
    }
}

/// How a validator backs its revealed judgments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationEvidence {
    /// Judgments secured by the validator's task stake.
    Staked { judgments: Vec<PairwiseJudgment> },
    /// Enclave attestation over the judgments.
    Attestation {
        judgments: Vec<PairwiseJudgment>,
        report: Vec<u8>,
    },
    /// Succinct proof that the judgments follow from the artifacts.
    ZkProof {
        judgments: Vec<PairwiseJudgment>,
        proof: Vec<u8>,
    },
}

impl ValidationEvidence {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationEvidence::Staked { .. } => "staked",
            ValidationEvidence::Attestation { .. } => "attestation",
            ValidationEvidence::ZkProof { .. } => "zk_proof",
        }
    }

    pub fn judgments(&self) -> &[PairwiseJudgment] {
        match self {
            ValidationEvidence::Staked { judgments }
            | ValidationEvidence::Attestation { judgments, .. }
            | ValidationEvidence::ZkProof { judgments, .. } => judgments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonSubmission {
    pub validator: AgentId,
    pub commitment: Hash,
    pub evidence: Option<ValidationEvidence>,
    pub revealed: bool,
    pub stake: TokenAmount,
    pub committed_at: u64,
    pub revealed_at: Option<u64>,
}

impl ComparisonSubmission {
    pub fn judgments(&self) -> &[PairwiseJudgment] {
        self.evidence
            .as_ref()
            .map(|e| e.judgments())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedSubmission {
    pub rank: u32,
    pub index: SubmissionIndex,
    pub author: AgentId,
    pub score: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Winner {
        index: SubmissionIndex,
        author: AgentId,
    },
    NoValidSubmissions,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardType {
    WinnerShare,
    ValidatorShare,
    ForfeitRedistribution,
    RequesterRefund,
    StakeReturned,
    RunnerUpBonus { rank: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardDistribution {
    pub recipient: AgentId,
    pub amount: TokenAmount,
    pub reward_type: RewardType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlashingReason {
    UnrevealedWork,
    UnrevealedComparison,
    DishonestValidator,
    RegistrationPenalty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingEvent {
    pub account: AgentId,
    pub amount: TokenAmount,
    pub reason: SlashingReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusPayment {
    pub recipient: AgentId,
    pub rank: u32,
    pub amount: TokenAmount,
    pub paid: bool,
}

/// Immutable record of how a task ended. Repeated finalize calls return it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReceipt {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub ranking: Vec<RankedSubmission>,
    pub distributions: Vec<RewardDistribution>,
    pub slashing_events: Vec<SlashingEvent>,
    pub bonuses: Vec<BonusPayment>,
    pub requester_refund: TokenAmount,
    pub finalized_at: u64,
    pub dispute_resolved: bool,
}

impl TaskReceipt {
    pub fn winner(&self) -> Option<AgentId> {
        match self.outcome {
            TaskOutcome::Winner { author, .. } => Some(author),
            _ => None,
        }
    }

    /// Sum paid to a recipient across all distribution records.
    pub fn paid_to(&self, recipient: &AgentId) -> TokenAmount {
        self.distributions
            .iter()
            .filter(|d| &d.recipient == recipient && d.reward_type != RewardType::StakeReturned)
            .map(|d| d.amount)
            .sum()
    }
}

/// Per-task storage: the task plus everything committed against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub submissions: Vec<WorkSubmission>,
    pub comparisons: BTreeMap<AgentId, ComparisonSubmission>,
    pub receipt: Option<TaskReceipt>,
}

impl TaskRecord {
    pub fn revealed_indices(&self) -> Vec<SubmissionIndex> {
        self.submissions
            .iter()
            .filter(|s| s.revealed)
            .map(|s| s.index)
            .collect()
    }

    pub fn digest_in_use(&self, digest: &Hash) -> bool {
        self.submissions.iter().any(|s| &s.commitment == digest)
            || self.comparisons.values().any(|c| &c.commitment == digest)
    }

    pub fn is_author(&self, agent: &AgentId) -> bool {
        self.submissions.iter().any(|s| &s.author == agent)
    }

    pub fn is_stakeholder(&self, agent: &AgentId) -> bool {
        &self.task.requester == agent
            || self.is_author(agent)
            || self.comparisons.contains_key(agent)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub disputed_tasks: usize,
    pub finalized_tasks: usize,
    pub cancelled_tasks: usize,
    pub total_rewards_distributed: TokenAmount,
    pub total_slashed: TokenAmount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_terminal_states() {
        assert!(TaskPhase::Finalized.is_terminal());
        assert!(TaskPhase::Cancelled.is_terminal());
        assert!(!TaskPhase::Created.is_terminal());
        assert!(!TaskPhase::ComparisonReveal.is_terminal());
    }

    #[test]
    fn test_phase_happy_path() {
        assert!(TaskPhase::Created.can_transition_to(&TaskPhase::AcceptingWork));
        assert!(TaskPhase::AcceptingWork.can_transition_to(&TaskPhase::WorkReveal));
        assert!(TaskPhase::WorkReveal.can_transition_to(&TaskPhase::AcceptingComparisons));
        assert!(TaskPhase::AcceptingComparisons.can_transition_to(&TaskPhase::ComparisonReveal));
        assert!(TaskPhase::ComparisonReveal.can_transition_to(&TaskPhase::Finalized));
    }

    #[test]
    fn test_phase_skips_forward() {
        assert!(TaskPhase::AcceptingWork.can_transition_to(&TaskPhase::ComparisonReveal));
        assert!(TaskPhase::WorkReveal.can_transition_to(&TaskPhase::Cancelled));
    }

    #[test]
    fn test_phase_invalid_transitions() {
        assert!(!TaskPhase::WorkReveal.can_transition_to(&TaskPhase::AcceptingWork));
        assert!(!TaskPhase::Finalized.can_transition_to(&TaskPhase::Cancelled));
        assert!(!TaskPhase::Cancelled.can_transition_to(&TaskPhase::AcceptingWork));
        assert!(!TaskPhase::AcceptingWork.can_transition_to(&TaskPhase::Finalized));
        assert!(!TaskPhase::ComparisonReveal.can_transition_to(&TaskPhase::Cancelled));
        assert!(!TaskPhase::Created.can_transition_to(&TaskPhase::WorkReveal));
    }

    #[test]
    fn test_deadline_validation() {
        assert!(Deadlines::new(10, 20, 30, 40).validate(0).is_ok());
        assert!(Deadlines::new(10, 20, 30, 40).validate(10).is_err());
        assert!(Deadlines::new(10, 10, 30, 40).validate(0).is_err());
        assert!(Deadlines::new(10, 20, 50, 40).validate(0).is_err());
    }

    #[test]
    fn test_window_boundaries() {
        let d = Deadlines::new(10, 20, 30, 40);
        assert_eq!(d.timing(Operation::SubmitWork, 9), None);
        assert_eq!(
            d.timing(Operation::SubmitWork, 10),
            Some(WindowTiming::TooLate { closed_at: 10 })
        );
        assert_eq!(d.timing(Operation::RevealWork, 10), None);
        assert_eq!(
            d.timing(Operation::RevealWork, 9),
            Some(WindowTiming::TooEarly { opens_at: 10 })
        );
        assert_eq!(d.timing(Operation::SubmitComparison, 20), None);
        assert_eq!(d.timing(Operation::RevealComparison, 39), None);
        assert_eq!(
            d.timing(Operation::Finalize, 39),
            Some(WindowTiming::TooEarly { opens_at: 40 })
        );
        assert_eq!(d.timing(Operation::Finalize, 1_000), None);
    }
}
