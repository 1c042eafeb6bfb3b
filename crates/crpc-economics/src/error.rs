use crate::types::TokenAmount;
use crpc_types::AgentId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Insufficient funds for {account}: needed {needed}, available {available}")]
    InsufficientFunds {
        account: AgentId,
        needed: TokenAmount,
        available: TokenAmount,
    },

    #[error("Insufficient locked balance for {account}: needed {needed}, locked {locked}")]
    InsufficientLocked {
        account: AgentId,
        needed: TokenAmount,
        locked: TokenAmount,
    },

    #[error("Balance overflow for {0}")]
    Overflow(AgentId),

    #[error("Cannot transfer to same account {0}")]
    SameAccount(AgentId),

    #[error("Empty ledger batch")]
    EmptyBatch,
}
