pub mod id;

pub use id::{AgentId, TaskId};

/// 32-byte digest used for commitments and derived identifiers.
pub type Hash = [u8; 32];

/// Position of a work submission inside its task (0..N-1, assigned in commit order).
pub type SubmissionIndex = u32;

/// Shortened hex rendering used in log fields.
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}
