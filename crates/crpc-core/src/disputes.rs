use crate::aggregator::{Aggregator, Ranking};
use crate::error::{CrpcError, Result};
use crate::types::ComparisonSubmission;
use crpc_types::{AgentId, SubmissionIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Decision supplied by the external resolver for a disputed task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    /// Replacement order, best first. Must be a permutation of the revealed submissions.
    pub corrected_ranking: Option<Vec<SubmissionIndex>>,
    /// Validators whose revealed judgments were dishonest. Their task stake is
    /// forfeited and their ballots are excluded from the recomputed ranking.
    pub dishonest_validators: Vec<AgentId>,
    pub notes: String,
}

impl DisputeResolution {
    /// Keep the aggregated outcome.
    pub fn uphold() -> Self {
        Self::default()
    }

    pub fn corrected(order: Vec<SubmissionIndex>) -> Self {
        Self {
            corrected_ranking: Some(order),
            ..Self::default()
        }
    }

    pub fn with_dishonest(mut self, validators: Vec<AgentId>) -> Self {
        self.dishonest_validators = validators;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

/// Ranking after applying a resolution, plus the validated dishonest set.
pub fn resolve_ranking(
    aggregator: &Aggregator,
    comparisons: &BTreeMap<AgentId, ComparisonSubmission>,
    resolution: &DisputeResolution,
) -> Result<(Option<Ranking>, BTreeSet<AgentId>)> {
    let mut dishonest = BTreeSet::new();
    for validator in &resolution.dishonest_validators {
        if !comparisons.contains_key(validator) {
            return Err(CrpcError::InvalidTaskInput(format!(
                "validator {} has no comparison on this task",
                validator.to_hex()
            )));
        }
        dishonest.insert(*validator);
    }

    let ranking = aggregator.aggregate(
        comparisons
            .iter()
            .filter(|(validator, c)| c.revealed && !dishonest.contains(*validator))
            .map(|(_, c)| c.judgments()),
    );

    let ranking = match (&resolution.corrected_ranking, ranking) {
        (None, ranking) => ranking,
        (Some(_), None) => {
            return Err(CrpcError::InvalidRanking(
                "no revealed submissions to rank".to_string(),
            ))
        }
        (Some(order), Some(ranking)) => Some(ranking.reordered(order).ok_or_else(|| {
            CrpcError::InvalidRanking(
                "corrected ranking must be a permutation of the revealed submissions".to_string(),
            )
        })?),
    };

    Ok((ranking, dishonest))
}
