//! Pairwise aggregation.
//!
//! Every valid validator ballot covers each unordered pair of revealed
//! submissions exactly once. A win is worth [`SCORE_SCALE`] points and a tie
//! splits it evenly. Totals are summed across validators and ranked
//! descending, with ties broken by the lowest submission index.

use crate::types::{Outcome, PairwiseJudgment, SCORE_SCALE};
use crpc_types::SubmissionIndex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CoverageError {
    #[error("expected {expected} judgments, got {actual}")]
    WrongCount { expected: usize, actual: usize },
    #[error("submission {0} compared with itself")]
    SelfPair(SubmissionIndex),
    #[error("submission {0} is not a revealed submission")]
    UnknownSubmission(SubmissionIndex),
    #[error("pair ({0}, {1}) judged more than once")]
    DuplicatePair(SubmissionIndex, SubmissionIndex),
}

/// Number of unordered pairs over `n` submissions.
pub fn required_pairs(n: usize) -> usize {
    n.saturating_mul(n.saturating_sub(1)) / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub index: SubmissionIndex,
    pub score: u64,
}

/// Submissions ordered best first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranking {
    pub entries: Vec<RankEntry>,
    pub valid_ballots: usize,
    pub rejected_ballots: usize,
}

impl Ranking {
    pub fn winner(&self) -> Option<SubmissionIndex> {
        self.entries.first().map(|e| e.index)
    }

    /// Rebuild a ranking in an externally decided order, keeping the scores.
    /// `order` must be a permutation of the ranked submissions.
    pub fn reordered(&self, order: &[SubmissionIndex]) -> Option<Ranking> {
        if order.len() != self.entries.len() {
            return None;
        }
        let mut entries = Vec::with_capacity(order.len());
        for index in order {
            let entry = self.entries.iter().find(|e| e.index == *index)?;
            if entries.iter().any(|e: &RankEntry| e.index == *index) {
                return None;
            }
            entries.push(*entry);
        }
        Some(Ranking {
            entries,
            valid_ballots: self.valid_ballots,
            rejected_ballots: self.rejected_ballots,
        })
    }
}

/// Scores ballots against a fixed set of revealed submissions.
#[derive(Debug, Clone)]
pub struct Aggregator {
    revealed: Vec<SubmissionIndex>,
}

impl Aggregator {
    pub fn new(mut revealed: Vec<SubmissionIndex>) -> Self {
        revealed.sort_unstable();
        revealed.dedup();
        Self { revealed }
    }

    pub fn revealed(&self) -> &[SubmissionIndex] {
        &self.revealed
    }

    fn position(&self, index: SubmissionIndex) -> Option<usize> {
        self.revealed.binary_search(&index).ok()
    }

    /// Check that `judgments` cover every unordered pair exactly once.
    pub fn check_coverage(&self, judgments: &[PairwiseJudgment]) -> Result<(), CoverageError> {
        let n = self.revealed.len();
        let expected = required_pairs(n);
        if judgments.len() > expected {
            return Err(CoverageError::WrongCount {
                expected,
                actual: judgments.len(),
            });
        }

        let mut seen = vec![false; n * n];
        for j in judgments {
            if j.a == j.b {
                return Err(CoverageError::SelfPair(j.a));
            }
            let pa = self
                .position(j.a)
                .ok_or(CoverageError::UnknownSubmission(j.a))?;
            let pb = self
                .position(j.b)
                .ok_or(CoverageError::UnknownSubmission(j.b))?;
            let (lo, hi) = if pa < pb { (pa, pb) } else { (pb, pa) };
            let slot = &mut seen[lo * n + hi];
            if *slot {
                return Err(CoverageError::DuplicatePair(j.a.min(j.b), j.a.max(j.b)));
            }
            *slot = true;
        }

        if judgments.len() != expected {
            return Err(CoverageError::WrongCount {
                expected,
                actual: judgments.len(),
            });
        }
        Ok(())
    }

    /// Per-submission points from one ballot, aligned with [`Self::revealed`].
    pub fn score_ballot(&self, judgments: &[PairwiseJudgment]) -> Result<Vec<u64>, CoverageError> {
        self.check_coverage(judgments)?;
        let mut scores = vec![0u64; self.revealed.len()];
        for j in judgments {
            // Coverage already resolved both indices.
            let (Some(pa), Some(pb)) = (self.position(j.a), self.position(j.b)) else {
                continue;
            };
            match j.outcome {
                Outcome::AWins => scores[pa] += SCORE_SCALE,
                Outcome::BWins => scores[pb] += SCORE_SCALE,
                Outcome::Tie => {
                    scores[pa] += SCORE_SCALE / 2;
                    scores[pb] += SCORE_SCALE / 2;
                }
            }
        }
        Ok(scores)
    }

    /// Sum valid ballots and rank. `None` when nothing was revealed.
    ///
    /// Ballots failing coverage are skipped. With zero valid ballots every
    /// submission scores zero and the lowest index wins.
    pub fn aggregate<'a, I>(&self, ballots: I) -> Option<Ranking>
    where
        I: IntoIterator<Item = &'a [PairwiseJudgment]>,
    {
        if self.revealed.is_empty() {
            return None;
        }

        let mut totals = vec![0u64; self.revealed.len()];
        let mut valid_ballots = 0;
        let mut rejected_ballots = 0;
        for ballot in ballots {
            match self.score_ballot(ballot) {
                Ok(scores) => {
                    for (total, score) in totals.iter_mut().zip(scores) {
                        *total = total.saturating_add(score);
                    }
                    valid_ballots += 1;
                }
                Err(_) => rejected_ballots += 1,
            }
        }

        let mut entries: Vec<RankEntry> = self
            .revealed
            .iter()
            .zip(totals)
            .map(|(index, score)| RankEntry {
                index: *index,
                score,
            })
            .collect();
        entries.sort_by(|x, y| y.score.cmp(&x.score).then(x.index.cmp(&y.index)));

        Some(Ranking {
            entries,
            valid_ballots,
            rejected_ballots,
        })
    }
}

/// Complete ballot over `revealed` where every pair is decided by `decide(a, b)`.
pub fn full_ballot<F>(revealed: &[SubmissionIndex], mut decide: F) -> Vec<PairwiseJudgment>
where
    F: FnMut(SubmissionIndex, SubmissionIndex) -> Outcome,
{
    let mut judgments = Vec::with_capacity(required_pairs(revealed.len()));
    for (i, a) in revealed.iter().enumerate() {
        for b in &revealed[i + 1..] {
            judgments.push(PairwiseJudgment::new(*a, *b, decide(*a, *b)));
        }
    }
    judgments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_pairs() {
        assert_eq!(required_pairs(0), 0);
        assert_eq!(required_pairs(1), 0);
        assert_eq!(required_pairs(2), 1);
        assert_eq!(required_pairs(3), 3);
        assert_eq!(required_pairs(20), 190);
    }

    #[test]
    fn test_coverage_accepts_complete_set() {
        let agg = Aggregator::new(vec![0, 1, 2]);
        let ballot = full_ballot(agg.revealed(), |_, _| Outcome::Tie);
        assert!(agg.check_coverage(&ballot).is_ok());
    }

    #[test]
    fn test_coverage_rejects_missing_pair() {
        let agg = Aggregator::new(vec![0, 1, 2]);
        let mut ballot = full_ballot(agg.revealed(), |_, _| Outcome::AWins);
        ballot.pop();
        assert_eq!(
            agg.check_coverage(&ballot),
            Err(CoverageError::WrongCount {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_coverage_rejects_reversed_duplicate() {
        let agg = Aggregator::new(vec![0, 1, 2]);
        let ballot = vec![
            PairwiseJudgment::new(0, 1, Outcome::AWins),
            PairwiseJudgment::new(1, 0, Outcome::AWins),
            PairwiseJudgment::new(1, 2, Outcome::AWins),
        ];
        assert_eq!(
            agg.check_coverage(&ballot),
            Err(CoverageError::DuplicatePair(0, 1))
        );
    }

    #[test]
    fn test_coverage_rejects_self_and_unknown() {
        let agg = Aggregator::new(vec![0, 2]);
        assert_eq!(
            agg.check_coverage(&[PairwiseJudgment::new(2, 2, Outcome::Tie)]),
            Err(CoverageError::SelfPair(2))
        );
        assert_eq!(
            agg.check_coverage(&[PairwiseJudgment::new(0, 1, Outcome::Tie)]),
            Err(CoverageError::UnknownSubmission(1))
        );
    }

    #[test]
    fn test_single_submission_needs_empty_ballot() {
        let agg = Aggregator::new(vec![4]);
        assert!(agg.check_coverage(&[]).is_ok());
        let ranking = agg.aggregate([&[][..]]).unwrap();
        assert_eq!(ranking.winner(), Some(4));
        assert_eq!(ranking.valid_ballots, 1);
    }

    #[test]
    fn test_no_revealed_submissions() {
        let agg = Aggregator::new(vec![]);
        assert!(agg.aggregate(std::iter::empty()).is_none());
    }

    #[test]
    fn test_ranking_and_tie_break() {
        // Two validators: one prefers 0, the other prefers 1; 2 always loses.
        let agg = Aggregator::new(vec![0, 1, 2]);
        let v1 = full_ballot(agg.revealed(), |_, _| Outcome::AWins);
        let v2 = vec![
            PairwiseJudgment::new(0, 1, Outcome::BWins),
            PairwiseJudgment::new(0, 2, Outcome::AWins),
            PairwiseJudgment::new(1, 2, Outcome::AWins),
        ];
        let ranking = agg.aggregate([v1.as_slice(), v2.as_slice()]).unwrap();
        assert_eq!(ranking.entries[0], RankEntry { index: 0, score: 300 });
        assert_eq!(ranking.entries[1], RankEntry { index: 1, score: 300 });
        assert_eq!(ranking.entries[2], RankEntry { index: 2, score: 0 });
    }

    #[test]
    fn test_ties_split_points() {
        let agg = Aggregator::new(vec![0, 1]);
        let ballot = [PairwiseJudgment::new(0, 1, Outcome::Tie)];
        assert_eq!(agg.score_ballot(&ballot).unwrap(), vec![50, 50]);
    }

    #[test]
    fn test_invalid_ballot_is_skipped() {
        let agg = Aggregator::new(vec![0, 1]);
        let good = [PairwiseJudgment::new(0, 1, Outcome::BWins)];
        let bad: [PairwiseJudgment; 0] = [];
        let ranking = agg.aggregate([&good[..], &bad[..]]).unwrap();
        assert_eq!(ranking.winner(), Some(1));
        assert_eq!(ranking.valid_ballots, 1);
        assert_eq!(ranking.rejected_ballots, 1);
    }

    #[test]
    fn test_reordered_requires_permutation() {
        let agg = Aggregator::new(vec![0, 1, 2]);
        let ballot = full_ballot(agg.revealed(), |_, _| Outcome::AWins);
        let ranking = agg.aggregate([ballot.as_slice()]).unwrap();

        let corrected = ranking.reordered(&[2, 0, 1]).unwrap();
        assert_eq!(corrected.winner(), Some(2));
        assert!(ranking.reordered(&[2, 2, 1]).is_none());
        assert!(ranking.reordered(&[0, 1]).is_none());
        assert!(ranking.reordered(&[0, 1, 7]).is_none());
    }
}
