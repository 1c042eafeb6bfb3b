use crpc_types::{AgentId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReputationOutcome {
    Won,
    ValidatedCorrectly,
    Forfeited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub task_id: TaskId,
    pub agent: AgentId,
    pub outcome: ReputationOutcome,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("reputation sink closed")]
    Closed,
}

/// Receives outcome notifications after a task settles. Failures never undo
/// a distribution; the caller only logs them.
pub trait ReputationSink: Send + Sync {
    fn notify(&self, event: ReputationEvent) -> Result<(), SinkError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReputationSink;

impl ReputationSink for NoopReputationSink {
    fn notify(&self, _event: ReputationEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards events over an unbounded channel to whatever tracks reputation.
pub struct ChannelReputationSink {
    tx: mpsc::UnboundedSender<ReputationEvent>,
}

impl ChannelReputationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReputationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReputationSink for ChannelReputationSink {
    fn notify(&self, event: ReputationEvent) -> Result<(), SinkError> {
        self.tx.send(event).map_err(|_| SinkError::Closed)
    }
}
