use crate::error::{LedgerError, Result};
use crate::ledger::{LedgerOp, TokenLedger};
use crate::types::TokenAmount;
use crpc_types::{short_hex, AgentId};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountInfo {
    /// Total balance, including the locked part.
    pub balance: TokenAmount,
    pub locked_balance: TokenAmount,
}

impl AccountInfo {
    pub fn available(&self) -> TokenAmount {
        self.balance.saturating_sub(self.locked_balance)
    }
}

/// In-memory token ledger with per-account balance and lock counters.
///
/// Every mutation happens under one write lock, so concurrent locks for the
/// same account (from different tasks) can never both spend the same funds.
pub struct BalanceManager {
    accounts: RwLock<HashMap<AgentId, AccountInfo>>,
}

impl Default for BalanceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BalanceManager {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Credit new funds to an account (genesis, faucet, tests).
    pub fn credit(&self, account: AgentId, amount: TokenAmount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }

        let mut accounts = self.accounts.write();
        let info = accounts.entry(account).or_default();
        let before = info.balance;
        info.balance = before
            .checked_add(amount)
            .ok_or(LedgerError::Overflow(account))?;

        info!(
            account = short_hex(account.as_bytes()),
            amount = %amount,
            balance_before = %before,
            balance_after = %info.balance,
            "💰 Balance credited"
        );
        Ok(())
    }

    pub fn account_info(&self, account: &AgentId) -> AccountInfo {
        self.accounts.read().get(account).copied().unwrap_or_default()
    }

    /// Sum of all balances. Constant under every [`LedgerOp`].
    pub fn total_supply(&self) -> TokenAmount {
        self.accounts.read().values().map(|info| info.balance).sum()
    }

    fn apply_op(
        scratch: &mut HashMap<AgentId, AccountInfo>,
        op: &LedgerOp,
    ) -> Result<()> {
        match op {
            LedgerOp::Lock { account, amount } => {
                let info = scratch.entry(*account).or_default();
                let available = info.available();
                if available < *amount {
                    return Err(LedgerError::InsufficientFunds {
                        account: *account,
                        needed: *amount,
                        available,
                    });
                }
                info.locked_balance = info
                    .locked_balance
                    .checked_add(*amount)
                    .ok_or(LedgerError::Overflow(*account))?;
            }
            LedgerOp::Unlock { account, amount } => {
                let info = scratch.entry(*account).or_default();
                info.locked_balance = info.locked_balance.checked_sub(*amount).ok_or(
                    LedgerError::InsufficientLocked {
                        account: *account,
                        needed: *amount,
                        locked: info.locked_balance,
                    },
                )?;
            }
            LedgerOp::Transfer { from, to, amount } => {
                if from == to {
                    return Err(LedgerError::SameAccount(*from));
                }
                let sender = scratch.entry(*from).or_default();
                let available = sender.available();
                if available < *amount {
                    return Err(LedgerError::InsufficientFunds {
                        account: *from,
                        needed: *amount,
                        available,
                    });
                }
                sender.balance = sender.balance.saturating_sub(*amount);
                let receiver = scratch.entry(*to).or_default();
                receiver.balance = receiver
                    .balance
                    .checked_add(*amount)
                    .ok_or(LedgerError::Overflow(*to))?;
            }
            LedgerOp::SettleLocked { from, to, amount } => {
                if from == to {
                    return Err(LedgerError::SameAccount(*from));
                }
                let sender = scratch.entry(*from).or_default();
                if sender.locked_balance < *amount {
                    return Err(LedgerError::InsufficientLocked {
                        account: *from,
                        needed: *amount,
                        locked: sender.locked_balance,
                    });
                }
                sender.locked_balance = sender.locked_balance.saturating_sub(*amount);
                sender.balance = sender.balance.saturating_sub(*amount);
                let receiver = scratch.entry(*to).or_default();
                receiver.balance = receiver
                    .balance
                    .checked_add(*amount)
                    .ok_or(LedgerError::Overflow(*to))?;
            }
        }
        Ok(())
    }
}

impl TokenLedger for BalanceManager {
    fn balance(&self, account: &AgentId) -> TokenAmount {
        self.account_info(account).balance
    }

    fn locked(&self, account: &AgentId) -> TokenAmount {
        self.account_info(account).locked_balance
    }

    fn apply_batch(&self, ops: &[LedgerOp]) -> Result<()> {
        if ops.is_empty() {
            return Err(LedgerError::EmptyBatch);
        }

        let mut accounts = self.accounts.write();

        // Work on a copy of the touched accounts; commit only if every op succeeds.
        let mut scratch: HashMap<AgentId, AccountInfo> = HashMap::new();
        for op in ops {
            for account in op.accounts() {
                scratch
                    .entry(account)
                    .or_insert_with(|| accounts.get(&account).copied().unwrap_or_default());
            }
        }

        for op in ops {
            Self::apply_op(&mut scratch, op)?;
        }

        for (account, info) in scratch {
            accounts.insert(account, info);
        }

        debug!(ops = ops.len(), "Ledger batch committed");
        Ok(())
    }
}
