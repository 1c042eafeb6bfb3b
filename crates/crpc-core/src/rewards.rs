//! Reward distribution.
//!
//! Settlement is planned as a pure function of the task record and a ranking,
//! producing a single [`StakeOp`] batch plus the receipt entries describing it.
//! Finalize and dispute resolution run the same plan.

use crate::aggregator::Ranking;
use crate::reputation::ReputationOutcome;
use crate::stake::{BeneficiaryPool, StakeOp, StakeScope};
use crate::types::{
    ComparisonSubmission, RankedSubmission, RewardDistribution, RewardType, SlashingEvent,
    SlashingReason, Task, TaskOutcome, WorkSubmission,
};
use crpc_economics::TokenAmount;
use crpc_types::AgentId;
use std::collections::{BTreeMap, BTreeSet};

pub struct SettlementInput<'a> {
    pub task: &'a Task,
    pub submissions: &'a [WorkSubmission],
    pub comparisons: &'a BTreeMap<AgentId, ComparisonSubmission>,
    pub ranking: Option<&'a Ranking>,
    /// Validators found dishonest by a dispute resolver.
    pub dishonest: &'a BTreeSet<AgentId>,
    /// Registration stake to slash from dishonest validators into the forfeit pool.
    pub registration_slashes: &'a [(AgentId, TokenAmount)],
}

#[derive(Debug, Clone, Default)]
pub struct DistributionPlan {
    pub ops: Vec<StakeOp>,
    pub ranking: Vec<RankedSubmission>,
    pub distributions: Vec<RewardDistribution>,
    pub slashing_events: Vec<SlashingEvent>,
    pub requester_refund: TokenAmount,
    pub notifications: Vec<(AgentId, ReputationOutcome)>,
    winner: Option<(u32, AgentId)>,
}

impl DistributionPlan {
    pub fn outcome(&self) -> TaskOutcome {
        match self.winner {
            Some((index, author)) => TaskOutcome::Winner { index, author },
            None => TaskOutcome::NoValidSubmissions,
        }
    }

    fn pay(
        &mut self,
        pool: BeneficiaryPool,
        recipient: AgentId,
        amount: TokenAmount,
        reward_type: RewardType,
    ) {
        if amount.is_zero() {
            return;
        }
        self.ops.push(StakeOp::Payout {
            pool,
            recipient,
            amount,
        });
        self.distributions.push(RewardDistribution {
            recipient,
            amount,
            reward_type,
        });
    }

    fn slash(
        &mut self,
        account: AgentId,
        scope: StakeScope,
        amount: TokenAmount,
        pool: BeneficiaryPool,
        reason: SlashingReason,
    ) {
        if amount.is_zero() {
            return;
        }
        self.ops.push(StakeOp::Slash {
            participant: account,
            scope,
            amount,
            pool,
        });
        self.slashing_events.push(SlashingEvent {
            account,
            amount,
            reason,
        });
    }
}

pub fn plan_distribution(input: &SettlementInput<'_>) -> DistributionPlan {
    let task = input.task;
    let scope = StakeScope::Task(task.id);
    let reward_pool = BeneficiaryPool::reward(task.id);
    let forfeit_pool = BeneficiaryPool::validator_forfeits(task.id);
    let mut plan = DistributionPlan::default();

    // The requester's locked reward becomes the pot.
    if !task.reward_pool.is_zero() {
        plan.ops.push(StakeOp::Slash {
            participant: task.requester,
            scope,
            amount: task.reward_pool,
            pool: reward_pool,
        });
    }

    let mut forfeited_work = TokenAmount::ZERO;
    for submission in input.submissions.iter().filter(|s| !s.revealed) {
        plan.slash(
            submission.author,
            scope,
            submission.stake,
            reward_pool,
            SlashingReason::UnrevealedWork,
        );
        forfeited_work = forfeited_work.saturating_add(submission.stake);
        plan.notifications
            .push((submission.author, ReputationOutcome::Forfeited));
    }

    let mut honest: Vec<(AgentId, TokenAmount)> = Vec::new();
    let mut forfeited_validators = TokenAmount::ZERO;
    for (validator, comparison) in input.comparisons {
        let dishonest = input.dishonest.contains(validator);
        if comparison.revealed && !dishonest {
            plan.ops.push(StakeOp::Release {
                participant: *validator,
                scope,
            });
            plan.distributions.push(RewardDistribution {
                recipient: *validator,
                amount: comparison.stake,
                reward_type: RewardType::StakeReturned,
            });
            honest.push((*validator, comparison.stake));
        } else {
            let reason = if dishonest {
                SlashingReason::DishonestValidator
            } else {
                SlashingReason::UnrevealedComparison
            };
            plan.slash(*validator, scope, comparison.stake, forfeit_pool, reason);
            forfeited_validators = forfeited_validators.saturating_add(comparison.stake);
            plan.notifications
                .push((*validator, ReputationOutcome::Forfeited));
        }
    }

    for (validator, amount) in input.registration_slashes {
        plan.slash(
            *validator,
            StakeScope::Registration,
            *amount,
            forfeit_pool,
            SlashingReason::RegistrationPenalty,
        );
        forfeited_validators = forfeited_validators.saturating_add(*amount);
    }

    plan.ranking = input
        .ranking
        .map(|ranking| rank_authors(ranking, input.submissions))
        .unwrap_or_default();

    let effective_pool = task.reward_pool.saturating_add(forfeited_work);
    let mut requester_refund = TokenAmount::ZERO;

    match plan.ranking.first().copied() {
        Some(top) => {
            let winner_amount = effective_pool.mul_bps(task.params.winner_share_bps);
            plan.pay(reward_pool, top.author, winner_amount, RewardType::WinnerShare);
            plan.winner = Some((top.index, top.author));
            plan.notifications.push((top.author, ReputationOutcome::Won));

            let validator_share = effective_pool.saturating_sub(winner_amount);
            if honest.is_empty() {
                requester_refund = requester_refund.saturating_add(validator_share);
            } else {
                let (share, dust) = validator_share.split_even(honest.len() as u64);
                for (validator, _) in &honest {
                    plan.pay(reward_pool, *validator, share, RewardType::ValidatorShare);
                }
                requester_refund = requester_refund.saturating_add(dust);
            }
        }
        None => {
            requester_refund = requester_refund.saturating_add(effective_pool);
        }
    }
    plan.pay(
        reward_pool,
        task.requester,
        requester_refund,
        RewardType::RequesterRefund,
    );

    // Forfeited validator stake goes pro rata to honest validators.
    let mut forfeit_remainder = forfeited_validators;
    let honest_stake: TokenAmount = honest.iter().map(|(_, stake)| *stake).sum();
    if !honest_stake.is_zero() {
        for (validator, stake) in &honest {
            let amount = forfeited_validators
                .mul_ratio(stake.to_base_units(), honest_stake.to_base_units());
            plan.pay(
                forfeit_pool,
                *validator,
                amount,
                RewardType::ForfeitRedistribution,
            );
            forfeit_remainder = forfeit_remainder.saturating_sub(amount);
        }
    }
    plan.pay(
        forfeit_pool,
        task.requester,
        forfeit_remainder,
        RewardType::RequesterRefund,
    );
    plan.requester_refund = requester_refund.saturating_add(forfeit_remainder);

    for (validator, _) in &honest {
        plan.notifications
            .push((*validator, ReputationOutcome::ValidatedCorrectly));
    }

    plan
}

fn rank_authors(ranking: &Ranking, submissions: &[WorkSubmission]) -> Vec<RankedSubmission> {
    ranking
        .entries
        .iter()
        .enumerate()
        .filter_map(|(position, entry)| {
            submissions
                .iter()
                .find(|s| s.index == entry.index)
                .map(|s| RankedSubmission {
                    rank: position as u32 + 1,
                    index: entry.index,
                    author: s.author,
                    score: entry.score,
                })
        })
        .collect()
}
