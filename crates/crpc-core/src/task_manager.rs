use crate::aggregator::{required_pairs, Aggregator, Ranking};
use crate::commitment;
use crate::config::ProtocolConfig;
use crate::disputes::{self, DisputeResolution};
use crate::error::{CrpcError, Result};
use crate::identity::{DerivedIdentityResolver, IdentityResolver};
use crate::registry::{ValidatorRegistration, ValidatorRegistry};
use crate::reputation::{NoopReputationSink, ReputationEvent, ReputationSink};
use crate::rewards::{plan_distribution, SettlementInput};
use crate::stake::{StakeLedger, StakeScope};
use crate::types::*;
use crpc_economics::{TokenAmount, TokenLedger};
use crpc_types::{short_hex, AgentId, Hash, SubmissionIndex, TaskId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Drives tasks through commit, reveal, comparison and settlement.
///
/// Every call takes the caller's clock reading `now`, checks the task's phase
/// window against it, and either applies completely or returns an error with
/// no state change. Calls on one task are serialised by a per-task lock;
/// calls on different tasks only meet at the stake ledger.
pub struct TaskManager {
    config: RwLock<Arc<ProtocolConfig>>,
    stakes: Arc<StakeLedger>,
    registry: ValidatorRegistry,
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<TaskRecord>>>>,
    sequence: AtomicU64,
    reputation: Arc<dyn ReputationSink>,
    identity: Arc<dyn IdentityResolver>,
}

impl TaskManager {
    pub fn new(ledger: Arc<dyn TokenLedger>, config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        let stakes = Arc::new(StakeLedger::new(ledger, config.accounts.escrow_account));
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            registry: ValidatorRegistry::new(stakes.clone()),
            stakes,
            tasks: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            reputation: Arc::new(NoopReputationSink),
            identity: Arc::new(DerivedIdentityResolver),
        })
    }

    pub fn with_reputation_sink(mut self, sink: Arc<dyn ReputationSink>) -> Self {
        self.reputation = sink;
        self
    }

    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = resolver;
        self
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<ProtocolConfig> {
        self.config.read().clone()
    }

    /// Swap in a new snapshot. Tasks already created keep their own parameters.
    pub fn update_config(&self, config: ProtocolConfig) -> Result<()> {
        config.validate()?;
        let mut current = self.config.write();
        if config.accounts.escrow_account != current.accounts.escrow_account {
            return Err(CrpcError::InvalidConfiguration(
                "escrow account cannot change while tasks may hold pots".to_string(),
            ));
        }
        *current = Arc::new(config);
        info!("⚙️ Protocol configuration updated");
        Ok(())
    }

    pub fn resolve(&self, handle: &str) -> Result<AgentId> {
        self.identity.resolve(handle)
    }

    pub fn stakes(&self) -> &Arc<StakeLedger> {
        &self.stakes
    }

    fn record(&self, task_id: &TaskId) -> Result<Arc<Mutex<TaskRecord>>> {
        self.tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| CrpcError::TaskNotFound(task_id.to_hex()))
    }

    fn check_window(task: &Task, operation: Operation, now: u64) -> Result<()> {
        if task.phase.is_terminal() || task.phase == TaskPhase::Created {
            return Err(CrpcError::PhaseViolation {
                operation,
                phase: task.phase,
                timing: WindowTiming::WrongState,
            });
        }
        if let Some(timing) = task.deadlines.timing(operation, now) {
            return Err(CrpcError::PhaseViolation {
                operation,
                phase: task.phase_at(now),
                timing,
            });
        }
        Ok(())
    }

    fn ensure_participant(config: &ProtocolConfig, agent: &AgentId) -> Result<()> {
        if agent == &config.accounts.escrow_account
            || Some(*agent) == config.rewards.incentive_pool
            || Some(*agent) == config.disputes.resolver
        {
            return Err(CrpcError::ConflictOfInterest(
                "protocol accounts cannot participate in tasks".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_task(
        config: &ProtocolConfig,
        requester: &AgentId,
        reward_pool: TokenAmount,
        deadlines: &Deadlines,
        description: &str,
        now: u64,
    ) -> Result<()> {
        Self::ensure_participant(config, requester)?;
        deadlines.validate(now).map_err(CrpcError::InvalidDeadlines)?;
        if reward_pool.is_zero() {
            return Err(CrpcError::InvalidTaskInput(
                "reward pool must be positive".to_string(),
            ));
        }
        if description.len() > config.limits.max_description_len {
            return Err(CrpcError::InvalidTaskInput(format!(
                "description exceeds {} bytes",
                config.limits.max_description_len
            )));
        }
        Ok(())
    }

    /// Open a task and lock the requester's reward pool.
    pub fn create_task(
        &self,
        requester: AgentId,
        reward_pool: TokenAmount,
        deadlines: Deadlines,
        description: impl Into<String>,
        now: u64,
    ) -> Result<TaskId> {
        let start = Instant::now();
        let config = self.config();
        let description = description.into();
        Self::validate_task(&config, &requester, reward_pool, &deadlines, &description, now)?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let task_id = TaskId::derive(&requester, sequence, &description);
        let mut task = Task {
            id: task_id,
            requester,
            reward_pool,
            description,
            phase: TaskPhase::Created,
            deadlines,
            params: TaskParams::from_config(&config),
            submission_count: 0,
            validator_count: 0,
            created_at: now,
            dispute: None,
        };

        self.stakes
            .lock(requester, StakeScope::Task(task_id), reward_pool)?;
        task.phase = TaskPhase::AcceptingWork;

        self.tasks.write().insert(
            task_id,
            Arc::new(Mutex::new(TaskRecord {
                task,
                submissions: Vec::new(),
                comparisons: Default::default(),
                receipt: None,
            })),
        );

        info!(
            task_id = %short_hex(task_id.as_bytes()),
            requester = %short_hex(requester.as_bytes()),
            reward = %reward_pool,
            work_deadline = deadlines.work,
            final_deadline = deadlines.finalize,
            duration_ms = start.elapsed().as_millis() as u64,
            "📋 Task created"
        );

        Ok(task_id)
    }

    /// Commit to a work artifact. Locks the task's submission stake.
    pub fn submit_work_commitment(
        &self,
        task_id: &TaskId,
        agent: AgentId,
        digest: Hash,
        now: u64,
    ) -> Result<SubmissionIndex> {
        let config = self.config();
        Self::ensure_participant(&config, &agent)?;
        let entry = self.record(task_id)?;
        let mut record = entry.lock();
        Self::check_window(&record.task, Operation::SubmitWork, now)?;

        if agent == record.task.requester {
            return Err(CrpcError::ConflictOfInterest(
                "requester cannot submit work to its own task".to_string(),
            ));
        }
        if record.is_author(&agent) {
            return Err(CrpcError::AlreadySubmitted(agent.to_hex()));
        }
        if record.submissions.len() >= record.task.params.max_submissions {
            return Err(CrpcError::CapacityExceeded {
                resource: "submissions",
                limit: record.task.params.max_submissions,
            });
        }
        if record.digest_in_use(&digest) {
            return Err(CrpcError::DuplicateCommitment);
        }

        let stake = record.task.params.submission_stake;
        self.stakes.lock(agent, StakeScope::Task(*task_id), stake)?;

        let index = record.submissions.len() as SubmissionIndex;
        record.submissions.push(WorkSubmission {
            index,
            author: agent,
            commitment: digest,
            artifact_ref: None,
            revealed: false,
            stake,
            committed_at: now,
            revealed_at: None,
            score: 0,
            rank: None,
        });
        record.task.submission_count += 1;
        record.task.sync_phase(now);

        info!(
            task_id = %short_hex(task_id.as_bytes()),
            author = %short_hex(agent.as_bytes()),
            index,
            digest = %hex::encode(&digest[..8]),
            stake = %stake,
            "📝 Work committed"
        );
        Ok(index)
    }

    /// Open a work commitment. Releases the submission stake on success.
    pub fn reveal_work(
        &self,
        task_id: &TaskId,
        agent: AgentId,
        index: SubmissionIndex,
        artifact_ref: &str,
        secret: &[u8],
        now: u64,
    ) -> Result<()> {
        let config = self.config();
        if artifact_ref.is_empty() || artifact_ref.len() > config.limits.max_artifact_ref_len {
            return Err(CrpcError::InvalidTaskInput(format!(
                "artifact reference must be 1..={} bytes",
                config.limits.max_artifact_ref_len
            )));
        }
        if secret.len() > config.limits.max_secret_len {
            return Err(CrpcError::InvalidTaskInput(format!(
                "secret exceeds {} bytes",
                config.limits.max_secret_len
            )));
        }

        let entry = self.record(task_id)?;
        let mut record = entry.lock();
        Self::check_window(&record.task, Operation::RevealWork, now)?;
        let deadline = record.task.deadlines.reveal;

        let submission = record
            .submissions
            .get(index as usize)
            .ok_or(CrpcError::SubmissionNotFound(index))?;
        if submission.author != agent {
            return Err(CrpcError::NotAuthor(index));
        }
        if submission.revealed {
            return Err(CrpcError::AlreadyRevealed);
        }

        let payload = commitment::encode_work_payload(task_id, &agent, artifact_ref);
        if !commitment::verify(&submission.commitment, &payload, secret) {
            debug!(
                task_id = %short_hex(task_id.as_bytes()),
                index,
                "Work reveal does not match commitment"
            );
            return Err(CrpcError::CommitmentMismatch { deadline });
        }

        let released = self.stakes.release(agent, StakeScope::Task(*task_id))?;

        let submission = &mut record.submissions[index as usize];
        submission.revealed = true;
        submission.artifact_ref = Some(artifact_ref.to_string());
        submission.revealed_at = Some(now);
        record.task.sync_phase(now);

        info!(
            task_id = %short_hex(task_id.as_bytes()),
            author = %short_hex(agent.as_bytes()),
            index,
            released = %released,
            "🔓 Work revealed"
        );
        Ok(())
    }

    /// Commit to a comparison set. Requires an active registration and locks
    /// the task's validator stake.
    pub fn submit_comparison_commitment(
        &self,
        task_id: &TaskId,
        validator: AgentId,
        digest: Hash,
        now: u64,
    ) -> Result<()> {
        let config = self.config();
        Self::ensure_participant(&config, &validator)?;
        let entry = self.record(task_id)?;
        let mut record = entry.lock();
        Self::check_window(&record.task, Operation::SubmitComparison, now)?;
        if record.task.is_abandoned(now) {
            return Err(CrpcError::PhaseViolation {
                operation: Operation::SubmitComparison,
                phase: record.task.phase,
                timing: WindowTiming::WrongState,
            });
        }

        if validator == record.task.requester || record.is_author(&validator) {
            return Err(CrpcError::ConflictOfInterest(
                "requester and authors cannot validate the same task".to_string(),
            ));
        }
        if record.comparisons.contains_key(&validator) {
            return Err(CrpcError::AlreadySubmitted(validator.to_hex()));
        }
        if record.comparisons.len() >= record.task.params.max_validators {
            return Err(CrpcError::CapacityExceeded {
                resource: "validators",
                limit: record.task.params.max_validators,
            });
        }
        if record.digest_in_use(&digest) {
            return Err(CrpcError::DuplicateCommitment);
        }

        self.registry
            .begin_commitment(&validator, config.stakes.minimum_validator_stake)?;
        let stake = record.task.params.validator_stake;
        if let Err(e) = self
            .stakes
            .lock(validator, StakeScope::Task(*task_id), stake)
        {
            self.registry.end_commitment(&validator);
            return Err(e);
        }

        record.comparisons.insert(
            validator,
            ComparisonSubmission {
                validator,
                commitment: digest,
                evidence: None,
                revealed: false,
                stake,
                committed_at: now,
                revealed_at: None,
            },
        );
        record.task.validator_count += 1;
        record.task.sync_phase(now);

        info!(
            task_id = %short_hex(task_id.as_bytes()),
            validator = %short_hex(validator.as_bytes()),
            digest = %hex::encode(&digest[..8]),
            stake = %stake,
            "🗳️ Comparison committed"
        );
        Ok(())
    }

    /// Reveal a staked pairwise judgment set.
    pub fn reveal_comparison(
        &self,
        task_id: &TaskId,
        validator: AgentId,
        judgments: Vec<PairwiseJudgment>,
        secret: &[u8],
        now: u64,
    ) -> Result<()> {
        self.reveal_evidence(
            task_id,
            validator,
            ValidationEvidence::Staked { judgments },
            secret,
            now,
        )
    }

    /// Reveal a comparison with its evidence. Only staked judgments are scored.
    pub fn reveal_evidence(
        &self,
        task_id: &TaskId,
        validator: AgentId,
        evidence: ValidationEvidence,
        secret: &[u8],
        now: u64,
    ) -> Result<()> {
        let ValidationEvidence::Staked { judgments } = &evidence else {
            return Err(CrpcError::UnsupportedEvidence(evidence.kind()));
        };
        let config = self.config();
        if secret.len() > config.limits.max_secret_len {
            return Err(CrpcError::InvalidTaskInput(format!(
                "secret exceeds {} bytes",
                config.limits.max_secret_len
            )));
        }

        let entry = self.record(task_id)?;
        let mut record = entry.lock();
        Self::check_window(&record.task, Operation::RevealComparison, now)?;
        let max_pairs = required_pairs(record.task.params.max_submissions);
        if judgments.len() > max_pairs {
            return Err(CrpcError::CapacityExceeded {
                resource: "judgments",
                limit: max_pairs,
            });
        }
        let deadline = record.task.deadlines.finalize;

        let comparison = record
            .comparisons
            .get(&validator)
            .ok_or_else(|| CrpcError::ComparisonNotFound(validator.to_hex()))?;
        if comparison.revealed {
            return Err(CrpcError::AlreadyRevealed);
        }

        let payload = commitment::encode_comparison_payload(task_id, &validator, judgments);
        if !commitment::verify(&comparison.commitment, &payload, secret) {
            debug!(
                task_id = %short_hex(task_id.as_bytes()),
                validator = %short_hex(validator.as_bytes()),
                "Comparison reveal does not match commitment"
            );
            return Err(CrpcError::CommitmentMismatch { deadline });
        }

        let aggregator = Aggregator::new(record.revealed_indices());
        aggregator
            .check_coverage(judgments)
            .map_err(|reason| CrpcError::IncompleteCoverage { reason })?;

        let pairs = judgments.len();
        if let Some(comparison) = record.comparisons.get_mut(&validator) {
            comparison.evidence = Some(evidence);
            comparison.revealed = true;
            comparison.revealed_at = Some(now);
        }
        record.task.sync_phase(now);

        info!(
            task_id = %short_hex(task_id.as_bytes()),
            validator = %short_hex(validator.as_bytes()),
            pairs,
            "🔍 Comparison revealed"
        );
        Ok(())
    }

    /// Aggregate, distribute and close the task. Repeated calls return the
    /// stored receipt without distributing again.
    pub fn finalize(&self, task_id: &TaskId, now: u64) -> Result<TaskReceipt> {
        let entry = self.record(task_id)?;
        let mut record = entry.lock();
        if let Some(receipt) = &record.receipt {
            return Ok(receipt.clone());
        }
        Self::check_window(&record.task, Operation::Finalize, now)?;
        if record.task.is_dispute_open() {
            return Err(CrpcError::DisputePending);
        }
        if record.task.submission_count == 0 {
            return self.cancel(&mut record, now);
        }

        let aggregator = Aggregator::new(record.revealed_indices());
        let ranking = aggregator.aggregate(
            record
                .comparisons
                .values()
                .filter(|c| c.revealed)
                .map(|c| c.judgments()),
        );
        self.settle(&mut record, ranking.as_ref(), &BTreeSet::new(), &[], now, false)
    }

    /// Cancel a task nobody submitted work to. Anyone may call this once the
    /// work deadline has passed.
    pub fn cancel_expired(&self, task_id: &TaskId, now: u64) -> Result<TaskReceipt> {
        let entry = self.record(task_id)?;
        let mut record = entry.lock();
        if let Some(receipt) = &record.receipt {
            if receipt.outcome == TaskOutcome::Cancelled {
                return Ok(receipt.clone());
            }
        }
        Self::check_window(&record.task, Operation::Cancel, now)?;
        if record.task.submission_count > 0 {
            return Err(CrpcError::PhaseViolation {
                operation: Operation::Cancel,
                phase: record.task.phase_at(now),
                timing: WindowTiming::WrongState,
            });
        }
        self.cancel(&mut record, now)
    }

    fn cancel(&self, record: &mut TaskRecord, now: u64) -> Result<TaskReceipt> {
        let task_id = record.task.id;
        let requester = record.task.requester;
        let refunded = self.stakes.release(requester, StakeScope::Task(task_id))?;

        let receipt = TaskReceipt {
            task_id,
            outcome: TaskOutcome::Cancelled,
            ranking: Vec::new(),
            distributions: vec![RewardDistribution {
                recipient: requester,
                amount: refunded,
                reward_type: RewardType::StakeReturned,
            }],
            slashing_events: Vec::new(),
            bonuses: Vec::new(),
            requester_refund: refunded,
            finalized_at: now,
            dispute_resolved: false,
        };
        record.task.phase = TaskPhase::Cancelled;
        record.task.reward_pool = TokenAmount::ZERO;
        record.receipt = Some(receipt.clone());

        info!(
            task_id = %short_hex(task_id.as_bytes()),
            refunded = %refunded,
            "🚫 Task cancelled, no work submitted"
        );
        Ok(receipt)
    }

    fn settle(
        &self,
        record: &mut TaskRecord,
        ranking: Option<&Ranking>,
        dishonest: &BTreeSet<AgentId>,
        registration_slashes: &[(AgentId, TokenAmount)],
        now: u64,
        dispute_resolved: bool,
    ) -> Result<TaskReceipt> {
        let start = Instant::now();
        let config = self.config();
        let task_id = record.task.id;

        let plan = plan_distribution(&SettlementInput {
            task: &record.task,
            submissions: &record.submissions,
            comparisons: &record.comparisons,
            ranking,
            dishonest,
            registration_slashes,
        });
        self.stakes.execute(&plan.ops)?;

        for (validator, amount) in registration_slashes {
            self.registry
                .record_slash(validator, *amount, config.stakes.minimum_validator_stake);
        }
        for validator in record.comparisons.keys() {
            self.registry.end_commitment(validator);
        }

        let bonuses = self.pay_runner_up_bonuses(&config, &plan.ranking);
        for event in &plan.slashing_events {
            warn!(
                task_id = %short_hex(task_id.as_bytes()),
                account = %short_hex(event.account.as_bytes()),
                amount = %event.amount,
                reason = ?event.reason,
                "⚔️ Stake forfeited"
            );
        }

        let receipt = TaskReceipt {
            task_id,
            outcome: plan.outcome(),
            ranking: plan.ranking.clone(),
            distributions: plan.distributions.clone(),
            slashing_events: plan.slashing_events.clone(),
            bonuses,
            requester_refund: plan.requester_refund,
            finalized_at: now,
            dispute_resolved,
        };
        for ranked in &plan.ranking {
            if let Some(submission) = record.submissions.get_mut(ranked.index as usize) {
                submission.score = ranked.score;
                submission.rank = Some(ranked.rank);
            }
        }
        record.task.sync_phase(now);
        record.task.phase = TaskPhase::Finalized;
        record.task.reward_pool = TokenAmount::ZERO;
        record.receipt = Some(receipt.clone());

        for (agent, outcome) in &plan.notifications {
            let event = ReputationEvent {
                task_id,
                agent: *agent,
                outcome: *outcome,
            };
            if let Err(e) = self.reputation.notify(event) {
                warn!(
                    task_id = %short_hex(task_id.as_bytes()),
                    agent = %short_hex(agent.as_bytes()),
                    error = %e,
                    "Reputation notification dropped"
                );
            }
        }

        info!(
            task_id = %short_hex(task_id.as_bytes()),
            outcome = ?receipt.outcome,
            ranked = receipt.ranking.len(),
            distributions = receipt.distributions.len(),
            forfeits = receipt.slashing_events.len(),
            refund = %receipt.requester_refund,
            duration_ms = start.elapsed().as_millis() as u64,
            "🏁 Task finalized"
        );
        Ok(receipt)
    }

    fn pay_runner_up_bonuses(
        &self,
        config: &ProtocolConfig,
        ranking: &[RankedSubmission],
    ) -> Vec<BonusPayment> {
        let mut bonuses = Vec::new();
        for (entry, amount) in ranking
            .iter()
            .skip(1)
            .zip(config.rewards.runner_up_bonuses.iter())
        {
            if amount.is_zero() {
                continue;
            }
            let paid = match config.rewards.incentive_pool {
                Some(pool) if self.stakes.available(&pool) >= *amount => {
                    match self.stakes.transfer(pool, entry.author, *amount) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(rank = entry.rank, error = %e, "Runner-up bonus transfer failed");
                            false
                        }
                    }
                }
                _ => {
                    warn!(rank = entry.rank, amount = %amount, "Runner-up bonus skipped, incentive pool unavailable");
                    false
                }
            };
            bonuses.push(BonusPayment {
                recipient: entry.author,
                rank: entry.rank,
                amount: *amount,
                paid,
            });
        }
        bonuses
    }

    /// Freeze distribution pending an external ruling. Open to the task's
    /// stakeholders once outcomes are revealed, once per task.
    pub fn mark_disputed(
        &self,
        task_id: &TaskId,
        caller: AgentId,
        reason: impl Into<String>,
        now: u64,
    ) -> Result<()> {
        let config = self.config();
        if config.disputes.resolver.is_none() {
            return Err(CrpcError::DisputesDisabled);
        }
        let entry = self.record(task_id)?;
        let mut record = entry.lock();
        Self::check_window(&record.task, Operation::Dispute, now)?;
        if record.task.is_abandoned(now) {
            return Err(CrpcError::PhaseViolation {
                operation: Operation::Dispute,
                phase: record.task.phase,
                timing: WindowTiming::WrongState,
            });
        }
        if !record.is_stakeholder(&caller) {
            return Err(CrpcError::Unauthorized(format!(
                "{} holds no stake in this task",
                caller.to_hex()
            )));
        }
        if record.task.dispute.is_some() {
            return Err(CrpcError::DisputeAlreadyOpen);
        }

        let reason = reason.into();
        record.task.dispute = Some(DisputeRecord {
            raised_by: caller,
            reason: reason.clone(),
            raised_at: now,
            status: DisputeStatus::Open,
        });
        record.task.sync_phase(now);

        warn!(
            task_id = %short_hex(task_id.as_bytes()),
            raised_by = %short_hex(caller.as_bytes()),
            reason = %reason,
            "⚖️ Task disputed, distribution frozen"
        );
        Ok(())
    }

    /// Apply the resolver's ruling and run the distribution.
    pub fn resolve_dispute(
        &self,
        task_id: &TaskId,
        resolver: AgentId,
        resolution: DisputeResolution,
        now: u64,
    ) -> Result<TaskReceipt> {
        let config = self.config();
        match config.disputes.resolver {
            None => return Err(CrpcError::DisputesDisabled),
            Some(expected) if expected != resolver => {
                return Err(CrpcError::Unauthorized(format!(
                    "{} is not the dispute resolver",
                    resolver.to_hex()
                )))
            }
            Some(_) => {}
        }

        let entry = self.record(task_id)?;
        let mut record = entry.lock();
        if !record.task.is_dispute_open() {
            return Err(CrpcError::NotDisputed);
        }
        Self::check_window(&record.task, Operation::Finalize, now)?;

        let aggregator = Aggregator::new(record.revealed_indices());
        let (ranking, dishonest) =
            disputes::resolve_ranking(&aggregator, &record.comparisons, &resolution)?;
        let registration_slashes: Vec<(AgentId, TokenAmount)> = dishonest
            .iter()
            .map(|v| {
                (
                    *v,
                    self.registry
                        .slash_amount(v, config.disputes.dishonesty_slash_bps),
                )
            })
            .filter(|(_, amount)| !amount.is_zero())
            .collect();

        let receipt = self.settle(
            &mut record,
            ranking.as_ref(),
            &dishonest,
            &registration_slashes,
            now,
            true,
        )?;
        if let Some(dispute) = record.task.dispute.as_mut() {
            dispute.status = DisputeStatus::Resolved;
        }

        info!(
            task_id = %short_hex(task_id.as_bytes()),
            corrected = resolution.corrected_ranking.is_some(),
            dishonest = dishonest.len(),
            notes = %resolution.notes,
            "⚖️ Dispute resolved"
        );
        Ok(receipt)
    }

    pub fn register_validator(&self, validator: AgentId, stake: TokenAmount, now: u64) -> Result<()> {
        let config = self.config();
        Self::ensure_participant(&config, &validator)?;
        self.registry
            .register(validator, stake, config.stakes.minimum_validator_stake, now)
    }

    pub fn top_up_validator(&self, validator: AgentId, amount: TokenAmount) -> Result<TokenAmount> {
        let config = self.config();
        self.registry
            .top_up(validator, amount, config.stakes.minimum_validator_stake)
    }

    pub fn deregister_validator(&self, validator: AgentId) -> Result<TokenAmount> {
        self.registry.deregister(validator)
    }

    pub fn get_validator(&self, validator: &AgentId) -> Option<ValidatorRegistration> {
        self.registry.get(validator)
    }

    pub fn active_validators(&self) -> Vec<AgentId> {
        self.registry
            .active_validators(self.config().stakes.minimum_validator_stake)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks
            .read()
            .get(task_id)
            .map(|entry| entry.lock().task.clone())
    }

    /// Phase implied by `now`, without mutating the task.
    pub fn phase_at(&self, task_id: &TaskId, now: u64) -> Result<TaskPhase> {
        let entry = self.record(task_id)?;
        let record = entry.lock();
        Ok(record.task.phase_at(now))
    }

    pub fn get_submissions(&self, task_id: &TaskId) -> Vec<WorkSubmission> {
        self.tasks
            .read()
            .get(task_id)
            .map(|entry| entry.lock().submissions.clone())
            .unwrap_or_default()
    }

    pub fn get_comparisons(&self, task_id: &TaskId) -> Vec<ComparisonSubmission> {
        self.tasks
            .read()
            .get(task_id)
            .map(|entry| entry.lock().comparisons.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_receipt(&self, task_id: &TaskId) -> Option<TaskReceipt> {
        self.tasks
            .read()
            .get(task_id)
            .and_then(|entry| entry.lock().receipt.clone())
    }

    /// Tasks whose clock-implied phase is `phase`, sorted by id.
    pub fn tasks_in_phase(&self, phase: TaskPhase, now: u64) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .read()
            .iter()
            .filter(|(_, entry)| entry.lock().task.phase_at(now) == phase)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// JSON snapshot of the task record: task, submissions, comparisons, receipt.
    pub fn export_task(&self, task_id: &TaskId) -> Result<String> {
        let entry = self.record(task_id)?;
        let record = entry.lock();
        serde_json::to_string_pretty(&*record).map_err(|e| CrpcError::Serialization(e.to_string()))
    }

    pub fn get_stats(&self) -> TaskStats {
        let tasks = self.tasks.read();
        let mut stats = TaskStats {
            total_tasks: tasks.len(),
            ..TaskStats::default()
        };

        for entry in tasks.values() {
            let record = entry.lock();
            match record.task.phase {
                TaskPhase::Finalized => stats.finalized_tasks += 1,
                TaskPhase::Cancelled => stats.cancelled_tasks += 1,
                _ => stats.active_tasks += 1,
            }
            if record.task.is_dispute_open() {
                stats.disputed_tasks += 1;
            }
            if let Some(receipt) = &record.receipt {
                for d in &receipt.distributions {
                    if matches!(
                        d.reward_type,
                        RewardType::WinnerShare
                            | RewardType::ValidatorShare
                            | RewardType::ForfeitRedistribution
                    ) {
                        stats.total_rewards_distributed =
                            stats.total_rewards_distributed.saturating_add(d.amount);
                    }
                }
                for b in receipt.bonuses.iter().filter(|b| b.paid) {
                    stats.total_rewards_distributed =
                        stats.total_rewards_distributed.saturating_add(b.amount);
                }
                for s in &receipt.slashing_events {
                    stats.total_slashed = stats.total_slashed.saturating_add(s.amount);
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crpc_economics::BalanceManager;

    const SECRET: &[u8] = b"correct horse battery staple";

    fn setup() -> (Arc<BalanceManager>, TaskManager, AgentId) {
        let balances = Arc::new(BalanceManager::new());
        let requester = AgentId::derive(b"requester");
        balances
            .credit(requester, TokenAmount::from_tokens(1_000))
            .unwrap();
        let manager = TaskManager::new(balances.clone(), ProtocolConfig::default()).unwrap();
        (balances, manager, requester)
    }

    fn funded(balances: &BalanceManager, name: &str) -> AgentId {
        let agent = AgentId::derive(name.as_bytes());
        balances.credit(agent, TokenAmount::from_tokens(500)).unwrap();
        agent
    }

    fn deadlines() -> Deadlines {
        Deadlines::new(100, 200, 300, 400)
    }

    #[test]
    fn test_create_task_locks_reward() {
        let (balances, manager, requester) = setup();
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "rank essays", 0)
            .unwrap();

        assert_eq!(balances.locked(&requester), TokenAmount::from_tokens(100));
        let task = manager.get_task(&task_id).unwrap();
        assert_eq!(task.phase, TaskPhase::AcceptingWork);
        assert_eq!(task.params.max_submissions, MAX_SUBMISSIONS_HARD_CAP);
    }

    #[test]
    fn test_create_task_rejects_bad_input() {
        let (_, manager, requester) = setup();
        assert!(matches!(
            manager.create_task(
                requester,
                TokenAmount::from_tokens(1),
                Deadlines::new(100, 100, 300, 400),
                "x",
                0
            ),
            Err(CrpcError::InvalidDeadlines(_))
        ));
        assert!(matches!(
            manager.create_task(requester, TokenAmount::ZERO, deadlines(), "x", 0),
            Err(CrpcError::InvalidTaskInput(_))
        ));
        assert!(matches!(
            manager.create_task(
                requester,
                TokenAmount::from_tokens(5_000),
                deadlines(),
                "x",
                0
            ),
            Err(CrpcError::InsufficientFunds { .. })
        ));
        assert!(manager.tasks_in_phase(TaskPhase::AcceptingWork, 0).is_empty());
    }

    #[test]
    fn test_out_of_window_calls_mutate_nothing() {
        let (balances, manager, requester) = setup();
        let author = funded(&balances, "author");
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "t", 0)
            .unwrap();

        let digest = commitment::work_commitment(&task_id, &author, "ipfs://a", SECRET);
        let err = manager
            .submit_work_commitment(&task_id, author, digest, 100)
            .unwrap_err();
        assert!(matches!(
            err,
            CrpcError::PhaseViolation {
                timing: WindowTiming::TooLate { closed_at: 100 },
                ..
            }
        ));
        assert_eq!(err.retry_hint(100), crate::RetryHint::Permanent);
        assert!(manager.get_submissions(&task_id).is_empty());
        assert_eq!(balances.locked(&author), TokenAmount::ZERO);

        manager
            .submit_work_commitment(&task_id, author, digest, 10)
            .unwrap();
        let err = manager
            .reveal_work(&task_id, author, 0, "ipfs://a", SECRET, 50)
            .unwrap_err();
        assert_eq!(err.retry_hint(50), crate::RetryHint::RetryLater);
    }

    #[test]
    fn test_reveal_mismatch_is_retryable() {
        let (balances, manager, requester) = setup();
        let author = funded(&balances, "author");
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "t", 0)
            .unwrap();
        let digest = commitment::work_commitment(&task_id, &author, "ipfs://a", SECRET);
        manager
            .submit_work_commitment(&task_id, author, digest, 10)
            .unwrap();

        let err = manager
            .reveal_work(&task_id, author, 0, "ipfs://b", SECRET, 150)
            .unwrap_err();
        assert!(matches!(err, CrpcError::CommitmentMismatch { deadline: 200 }));
        assert_eq!(err.retry_hint(150), crate::RetryHint::RetryNow);
        assert_eq!(err.retry_hint(200), crate::RetryHint::Permanent);
        assert!(!manager.get_submissions(&task_id)[0].revealed);

        manager
            .reveal_work(&task_id, author, 0, "ipfs://a", SECRET, 160)
            .unwrap();
        assert!(manager.get_submissions(&task_id)[0].revealed);
        assert_eq!(balances.locked(&author), TokenAmount::ZERO);
        assert!(matches!(
            manager.reveal_work(&task_id, author, 0, "ipfs://a", SECRET, 170),
            Err(CrpcError::AlreadyRevealed)
        ));
    }

    #[test]
    fn test_copied_digest_cannot_be_revealed_by_copier() {
        let (balances, manager, requester) = setup();
        let honest = funded(&balances, "honest");
        let copier = funded(&balances, "copier");
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "t", 0)
            .unwrap();
        let digest = commitment::work_commitment(&task_id, &honest, "ipfs://a", SECRET);
        manager
            .submit_work_commitment(&task_id, honest, digest, 10)
            .unwrap();
        assert!(matches!(
            manager.submit_work_commitment(&task_id, copier, digest, 11),
            Err(CrpcError::DuplicateCommitment)
        ));
        assert!(matches!(
            manager.reveal_work(&task_id, copier, 0, "ipfs://a", SECRET, 150),
            Err(CrpcError::NotAuthor(0))
        ));
    }

    #[test]
    fn test_conflict_of_interest() {
        let (balances, manager, requester) = setup();
        let author = funded(&balances, "author");
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "t", 0)
            .unwrap();
        let own = commitment::work_commitment(&task_id, &requester, "ipfs://r", SECRET);
        assert!(matches!(
            manager.submit_work_commitment(&task_id, requester, own, 10),
            Err(CrpcError::ConflictOfInterest(_))
        ));

        let digest = commitment::work_commitment(&task_id, &author, "ipfs://a", SECRET);
        manager
            .submit_work_commitment(&task_id, author, digest, 10)
            .unwrap();
        manager
            .register_validator(author, TokenAmount::from_tokens(100), 0)
            .unwrap();
        assert!(matches!(
            manager.submit_comparison_commitment(&task_id, author, [7u8; 32], 250),
            Err(CrpcError::ConflictOfInterest(_))
        ));
    }

    #[test]
    fn test_unregistered_validator_rejected() {
        let (balances, manager, requester) = setup();
        let author = funded(&balances, "author");
        let validator = funded(&balances, "validator");
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "t", 0)
            .unwrap();
        let digest = commitment::work_commitment(&task_id, &author, "ipfs://a", SECRET);
        manager
            .submit_work_commitment(&task_id, author, digest, 10)
            .unwrap();
        assert!(matches!(
            manager.submit_comparison_commitment(&task_id, validator, [1u8; 32], 250),
            Err(CrpcError::ValidatorNotRegistered(_))
        ));
        assert!(manager.get_comparisons(&task_id).is_empty());
    }

    #[test]
    fn test_unsupported_evidence() {
        let (_, manager, requester) = setup();
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "t", 0)
            .unwrap();
        let err = manager
            .reveal_evidence(
                &task_id,
                requester,
                ValidationEvidence::ZkProof {
                    judgments: vec![],
                    proof: vec![1, 2, 3],
                },
                SECRET,
                350,
            )
            .unwrap_err();
        assert!(matches!(err, CrpcError::UnsupportedEvidence("zk_proof")));
    }

    /// Two revealed works and a registered validator with a comparison
    /// committed over `judgments`.
    fn committed_ballot(
        judgments: &[PairwiseJudgment],
    ) -> (Arc<BalanceManager>, TaskManager, TaskId, AgentId) {
        let (balances, manager, requester) = setup();
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "t", 0)
            .unwrap();
        let authors = [funded(&balances, "author-0"), funded(&balances, "author-1")];
        for (i, author) in authors.iter().enumerate() {
            let uri = format!("ipfs://{}", i);
            let digest = commitment::work_commitment(&task_id, author, &uri, SECRET);
            manager
                .submit_work_commitment(&task_id, *author, digest, 10)
                .unwrap();
        }
        for (i, author) in authors.iter().enumerate() {
            let uri = format!("ipfs://{}", i);
            manager
                .reveal_work(&task_id, *author, i as u32, &uri, SECRET, 150)
                .unwrap();
        }

        let validator = funded(&balances, "validator");
        manager
            .register_validator(validator, TokenAmount::from_tokens(100), 0)
            .unwrap();
        let digest = commitment::comparison_commitment(&task_id, &validator, judgments, SECRET);
        manager
            .submit_comparison_commitment(&task_id, validator, digest, 250)
            .unwrap();
        (balances, manager, task_id, validator)
    }

    #[test]
    fn test_incomplete_ballot_cannot_be_fixed() {
        let (_, manager, task_id, validator) = committed_ballot(&[]);

        let err = manager
            .reveal_comparison(&task_id, validator, vec![], SECRET, 350)
            .unwrap_err();
        assert!(matches!(err, CrpcError::IncompleteCoverage { .. }));
        assert_eq!(err.retry_hint(350), crate::RetryHint::Permanent);

        let full = crate::aggregator::full_ballot(&[0, 1], |_, _| Outcome::AWins);
        let retry = manager
            .reveal_comparison(&task_id, validator, full, SECRET, 360)
            .unwrap_err();
        assert!(matches!(retry, CrpcError::CommitmentMismatch { deadline: 400 }));
        assert!(!manager.get_comparisons(&task_id)[0].revealed);
    }

    #[test]
    fn test_oversized_ballot_rejected_before_hashing() {
        let full = crate::aggregator::full_ballot(&[0, 1], |_, _| Outcome::Tie);
        let (_, manager, task_id, validator) = committed_ballot(&full);

        let limit = required_pairs(MAX_SUBMISSIONS_HARD_CAP);
        let flood = vec![PairwiseJudgment::new(0, 1, Outcome::AWins); limit + 1];
        let err = manager
            .reveal_comparison(&task_id, validator, flood, SECRET, 350)
            .unwrap_err();
        assert!(matches!(
            err,
            CrpcError::CapacityExceeded { resource: "judgments", limit: l } if l == limit
        ));
        assert!(!manager.get_comparisons(&task_id)[0].revealed);

        manager
            .reveal_comparison(&task_id, validator, full, SECRET, 360)
            .unwrap();
        assert!(manager.get_comparisons(&task_id)[0].revealed);
    }

    #[test]
    fn test_cancel_expired_refunds_requester() {
        let (balances, manager, requester) = setup();
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(100), deadlines(), "t", 0)
            .unwrap();

        assert!(matches!(
            manager.cancel_expired(&task_id, 99),
            Err(CrpcError::PhaseViolation {
                timing: WindowTiming::TooEarly { opens_at: 100 },
                ..
            })
        ));
        let receipt = manager.cancel_expired(&task_id, 100).unwrap();
        assert_eq!(receipt.outcome, TaskOutcome::Cancelled);
        assert_eq!(receipt.requester_refund, TokenAmount::from_tokens(100));
        assert_eq!(balances.locked(&requester), TokenAmount::ZERO);
        assert_eq!(manager.get_task(&task_id).unwrap().phase, TaskPhase::Cancelled);

        // Idempotent, and finalize reports the same receipt.
        assert_eq!(manager.cancel_expired(&task_id, 150).unwrap(), receipt);
        assert_eq!(manager.finalize(&task_id, 500).unwrap(), receipt);
    }

    #[test]
    fn test_update_config_keeps_task_params() {
        let (balances, manager, requester) = setup();
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(10), deadlines(), "t", 0)
            .unwrap();

        let mut config = (*manager.config()).clone();
        config.stakes.submission_stake = TokenAmount::from_tokens(50);
        manager.update_config(config.clone()).unwrap();

        let author = funded(&balances, "author");
        let digest = commitment::work_commitment(&task_id, &author, "ipfs://a", SECRET);
        manager
            .submit_work_commitment(&task_id, author, digest, 10)
            .unwrap();
        assert_eq!(balances.locked(&author), TokenAmount::from_tokens(10));

        config.accounts.escrow_account = AgentId::derive(b"another escrow");
        assert!(matches!(
            manager.update_config(config),
            Err(CrpcError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_resolve_uses_configured_resolver() {
        let (_, manager, _) = setup();
        assert_eq!(
            manager.resolve("alice").unwrap(),
            AgentId::derive(b"alice")
        );

        let registry = Arc::new(crate::identity::StaticIdentityResolver::new());
        let bob = AgentId::derive(b"bob's key");
        registry.insert("bob", bob);
        let manager = manager.with_identity_resolver(registry);
        assert_eq!(manager.resolve("bob").unwrap(), bob);
        assert!(matches!(
            manager.resolve("carol"),
            Err(CrpcError::IdentityResolution(_))
        ));
    }

    #[test]
    fn test_export_task_snapshot() {
        let (_, manager, requester) = setup();
        let task_id = manager
            .create_task(requester, TokenAmount::from_tokens(10), deadlines(), "t", 0)
            .unwrap();
        let json = manager.export_task(&task_id).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["task"]["requester"], requester.to_hex());
        assert_eq!(value["task"]["phase"], "AcceptingWork");
    }
}
