//! Hiding, binding commitments over work artifacts and comparison sets.
//!
//! A digest is `blake3(DOMAIN || 0x00 || len(payload) || payload || len(secret) || secret)`
//! with lengths as little-endian u64. Payloads are length-prefixed encodings that
//! bind the task and the committer, so a digest cannot be replayed by another
//! participant or against another task.

use crate::types::PairwiseJudgment;
use crpc_types::{AgentId, Hash, TaskId};
use subtle::ConstantTimeEq;

pub mod domains {
    pub const COMMITMENT_V1: &[u8] = b"CRPC_COMMITMENT_V1";
    pub const WORK_PAYLOAD_V1: &[u8] = b"CRPC_WORK_PAYLOAD_V1";
    pub const COMPARISON_PAYLOAD_V1: &[u8] = b"CRPC_COMPARISON_PAYLOAD_V1";
}

pub fn commit(payload: &[u8], secret: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domains::COMMITMENT_V1);
    hasher.update(&[0u8]);
    hasher.update(&(payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    hasher.update(&(secret.len() as u64).to_le_bytes());
    hasher.update(secret);
    *hasher.finalize().as_bytes()
}

/// Constant-time check that `digest` opens to `(payload, secret)`.
pub fn verify(digest: &Hash, payload: &[u8], secret: &[u8]) -> bool {
    let computed = commit(payload, secret);
    computed[..].ct_eq(&digest[..]).into()
}

fn encode_header(out: &mut Vec<u8>, domain: &[u8], task: &TaskId, committer: &AgentId) {
    out.extend_from_slice(domain);
    out.push(0);
    out.extend_from_slice(task.as_bytes());
    out.extend_from_slice(committer.as_bytes());
}

pub fn encode_work_payload(task: &TaskId, author: &AgentId, artifact_ref: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(domains::WORK_PAYLOAD_V1.len() + 73 + artifact_ref.len());
    encode_header(&mut out, domains::WORK_PAYLOAD_V1, task, author);
    out.extend_from_slice(&(artifact_ref.len() as u64).to_le_bytes());
    out.extend_from_slice(artifact_ref.as_bytes());
    out
}

/// Judgments are encoded in the order given; a validator must reveal them in
/// the same order they committed to.
pub fn encode_comparison_payload(
    task: &TaskId,
    validator: &AgentId,
    judgments: &[PairwiseJudgment],
) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(domains::COMPARISON_PAYLOAD_V1.len() + 69 + judgments.len() * 9);
    encode_header(&mut out, domains::COMPARISON_PAYLOAD_V1, task, validator);
    out.extend_from_slice(&(judgments.len() as u32).to_le_bytes());
    for j in judgments {
        out.extend_from_slice(&j.a.to_le_bytes());
        out.extend_from_slice(&j.b.to_le_bytes());
        out.push(j.outcome.tag());
    }
    out
}

pub fn work_commitment(task: &TaskId, author: &AgentId, artifact_ref: &str, secret: &[u8]) -> Hash {
    commit(&encode_work_payload(task, author, artifact_ref), secret)
}

pub fn comparison_commitment(
    task: &TaskId,
    validator: &AgentId,
    judgments: &[PairwiseJudgment],
    secret: &[u8],
) -> Hash {
    commit(&encode_comparison_payload(task, validator, judgments), secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;

    fn ids() -> (TaskId, AgentId, AgentId) {
        let requester = AgentId::derive(b"requester");
        (
            TaskId::derive(&requester, 0, "task"),
            AgentId::derive(b"alice"),
            AgentId::derive(b"bob"),
        )
    }

    #[test]
    fn test_commit_verify() {
        let digest = commit(b"payload", b"secret");
        assert!(verify(&digest, b"payload", b"secret"));
        assert!(!verify(&digest, b"payload", b"secreT"));
        assert!(!verify(&digest, b"payloaD", b"secret"));
    }

    #[test]
    fn test_boundary_shift_changes_digest() {
        // Moving bytes between payload and secret must not collide.
        assert_ne!(commit(b"ab", b"c"), commit(b"a", b"bc"));
    }

    #[test]
    fn test_work_commitment_binds_author() {
        let (task, alice, bob) = ids();
        let digest = work_commitment(&task, &alice, "ipfs://artifact", b"s3cret");
        assert!(verify(
            &digest,
            &encode_work_payload(&task, &alice, "ipfs://artifact"),
            b"s3cret"
        ));
        assert!(!verify(
            &digest,
            &encode_work_payload(&task, &bob, "ipfs://artifact"),
            b"s3cret"
        ));
    }

    #[test]
    fn test_comparison_commitment_binds_order_and_outcome() {
        let (task, alice, _) = ids();
        let j1 = PairwiseJudgment::new(0, 1, Outcome::AWins);
        let j2 = PairwiseJudgment::new(0, 2, Outcome::Tie);
        let digest = comparison_commitment(&task, &alice, &[j1, j2], b"k");

        assert!(verify(
            &digest,
            &encode_comparison_payload(&task, &alice, &[j1, j2]),
            b"k"
        ));
        assert!(!verify(
            &digest,
            &encode_comparison_payload(&task, &alice, &[j2, j1]),
            b"k"
        ));
        let flipped = PairwiseJudgment::new(0, 1, Outcome::BWins);
        assert!(!verify(
            &digest,
            &encode_comparison_payload(&task, &alice, &[flipped, j2]),
            b"k"
        ));
    }
}
