use crate::error::Result;
use crate::types::TokenAmount;
use crpc_types::AgentId;

/// A single primitive applied by [`TokenLedger::apply_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOp {
    /// Move `amount` of the account's available balance into its locked balance.
    Lock { account: AgentId, amount: TokenAmount },
    /// Return `amount` of locked balance to the account's available balance.
    Unlock { account: AgentId, amount: TokenAmount },
    /// Move available balance between accounts.
    Transfer {
        from: AgentId,
        to: AgentId,
        amount: TokenAmount,
    },
    /// Consume `amount` of `from`'s locked balance and credit it to `to` as available.
    SettleLocked {
        from: AgentId,
        to: AgentId,
        amount: TokenAmount,
    },
}

impl LedgerOp {
    /// Accounts read or written by this op.
    pub fn accounts(&self) -> Vec<AgentId> {
        match self {
            LedgerOp::Lock { account, .. } | LedgerOp::Unlock { account, .. } => vec![*account],
            LedgerOp::Transfer { from, to, .. } | LedgerOp::SettleLocked { from, to, .. } => {
                vec![*from, *to]
            }
        }
    }
}

/// The external token rail. The protocol never mints or burns; it only moves
/// existing balances through these primitives.
pub trait TokenLedger: Send + Sync {
    /// Total balance (available + locked).
    fn balance(&self, account: &AgentId) -> TokenAmount;

    fn locked(&self, account: &AgentId) -> TokenAmount;

    fn available(&self, account: &AgentId) -> TokenAmount {
        self.balance(account).saturating_sub(self.locked(account))
    }

    /// Apply every op or none of them.
    fn apply_batch(&self, ops: &[LedgerOp]) -> Result<()>;
}
