use crate::error::{CrpcError, Result};
use crpc_economics::{LedgerOp, TokenAmount, TokenLedger};
use crpc_types::{short_hex, AgentId, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What a stake lock secures. A participant holds at most one lock per scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StakeScope {
    Task(TaskId),
    Registration,
}

impl From<TaskId> for StakeScope {
    fn from(task: TaskId) -> Self {
        StakeScope::Task(task)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Requester reward plus forfeited work stakes.
    Reward,
    /// Forfeited validator stakes, redistributed to honest validators.
    ValidatorForfeits,
}

/// Per-task pot held by the escrow account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeneficiaryPool {
    pub task: TaskId,
    pub kind: PoolKind,
}

impl BeneficiaryPool {
    pub fn reward(task: TaskId) -> Self {
        Self {
            task,
            kind: PoolKind::Reward,
        }
    }

    pub fn validator_forfeits(task: TaskId) -> Self {
        Self {
            task,
            kind: PoolKind::ValidatorForfeits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StakeOp {
    Lock {
        participant: AgentId,
        scope: StakeScope,
        amount: TokenAmount,
    },
    /// Return the whole lock to the participant. Releasing an absent lock moves nothing.
    Release {
        participant: AgentId,
        scope: StakeScope,
    },
    Slash {
        participant: AgentId,
        scope: StakeScope,
        amount: TokenAmount,
        pool: BeneficiaryPool,
    },
    Payout {
        pool: BeneficiaryPool,
        recipient: AgentId,
        amount: TokenAmount,
    },
    /// Pay whatever remains in the pool.
    Drain {
        pool: BeneficiaryPool,
        recipient: AgentId,
    },
}

#[derive(Debug, Clone, Default)]
struct StakeBook {
    locks: HashMap<(AgentId, StakeScope), TokenAmount>,
    pools: HashMap<BeneficiaryPool, TokenAmount>,
}

/// Scratch view over the book; writes land here until the batch commits.
struct Overlay<'a> {
    book: &'a StakeBook,
    locks: HashMap<(AgentId, StakeScope), TokenAmount>,
    pools: HashMap<BeneficiaryPool, TokenAmount>,
}

impl<'a> Overlay<'a> {
    fn new(book: &'a StakeBook) -> Self {
        Self {
            book,
            locks: HashMap::new(),
            pools: HashMap::new(),
        }
    }

    fn lock(&self, key: &(AgentId, StakeScope)) -> TokenAmount {
        self.locks
            .get(key)
            .or_else(|| self.book.locks.get(key))
            .copied()
            .unwrap_or_default()
    }

    fn pool(&self, pool: &BeneficiaryPool) -> TokenAmount {
        self.pools
            .get(pool)
            .or_else(|| self.book.pools.get(pool))
            .copied()
            .unwrap_or_default()
    }

    fn into_writes(self) -> Writes {
        (self.locks, self.pools)
    }
}

type Writes = (
    HashMap<(AgentId, StakeScope), TokenAmount>,
    HashMap<BeneficiaryPool, TokenAmount>,
);

impl StakeBook {
    fn commit(&mut self, (locks, pools): Writes) {
        for (key, amount) in locks {
            if amount.is_zero() {
                self.locks.remove(&key);
            } else {
                self.locks.insert(key, amount);
            }
        }
        for (key, amount) in pools {
            if amount.is_zero() {
                self.pools.remove(&key);
            } else {
                self.pools.insert(key, amount);
            }
        }
    }
}

/// Stake ledger adapter: translates scoped locks, slashes and pool payouts
/// into primitive [`LedgerOp`]s on the external token rail.
///
/// Slashed stake moves into the escrow account and is tracked per pool, so
/// every token is either in a participant's available balance, locked under
/// exactly one scope, or attributed to exactly one pool.
pub struct StakeLedger {
    ledger: Arc<dyn TokenLedger>,
    escrow_account: AgentId,
    book: Mutex<StakeBook>,
}

impl StakeLedger {
    pub fn new(ledger: Arc<dyn TokenLedger>, escrow_account: AgentId) -> Self {
        Self {
            ledger,
            escrow_account,
            book: Mutex::new(StakeBook::default()),
        }
    }

    pub fn escrow_account(&self) -> AgentId {
        self.escrow_account
    }

    /// Apply `ops` in order as one atomic batch. Returns the amount each op moved.
    ///
    /// Either the whole batch lands on both the stake book and the token
    /// ledger, or neither changes.
    pub fn execute(&self, ops: &[StakeOp]) -> Result<Vec<TokenAmount>> {
        let mut book = self.book.lock();
        let mut overlay = Overlay::new(&book);
        let mut ledger_ops = Vec::with_capacity(ops.len());
        let mut moved = Vec::with_capacity(ops.len());

        for op in ops {
            let amount = self.apply(&mut overlay, op, &mut ledger_ops)?;
            moved.push(amount);
        }

        if !ledger_ops.is_empty() {
            self.ledger.apply_batch(&ledger_ops)?;
        }

        let writes = overlay.into_writes();
        book.commit(writes);

        debug!(ops = ops.len(), ledger_ops = ledger_ops.len(), "Stake batch applied");
        Ok(moved)
    }

    fn apply(
        &self,
        overlay: &mut Overlay<'_>,
        op: &StakeOp,
        ledger_ops: &mut Vec<LedgerOp>,
    ) -> Result<TokenAmount> {
        match op {
            StakeOp::Lock {
                participant,
                scope,
                amount,
            } => {
                if amount.is_zero() {
                    return Ok(TokenAmount::ZERO);
                }
                let key = (*participant, *scope);
                let current = overlay.lock(&key);
                let next = current
                    .checked_add(*amount)
                    .ok_or(CrpcError::Ledger(crpc_economics::LedgerError::Overflow(*participant)))?;
                overlay.locks.insert(key, next);
                ledger_ops.push(LedgerOp::Lock {
                    account: *participant,
                    amount: *amount,
                });
                Ok(*amount)
            }
            StakeOp::Release { participant, scope } => {
                let key = (*participant, *scope);
                let current = overlay.lock(&key);
                if current.is_zero() {
                    return Ok(TokenAmount::ZERO);
                }
                overlay.locks.insert(key, TokenAmount::ZERO);
                ledger_ops.push(LedgerOp::Unlock {
                    account: *participant,
                    amount: current,
                });
                Ok(current)
            }
            StakeOp::Slash {
                participant,
                scope,
                amount,
                pool,
            } => {
                if amount.is_zero() {
                    return Ok(TokenAmount::ZERO);
                }
                let key = (*participant, *scope);
                let current = overlay.lock(&key);
                let remaining =
                    current
                        .checked_sub(*amount)
                        .ok_or(CrpcError::InsufficientLockedStake {
                            requested: *amount,
                            locked: current,
                        })?;
                overlay.locks.insert(key, remaining);
                let pot = overlay.pool(pool).saturating_add(*amount);
                overlay.pools.insert(*pool, pot);
                ledger_ops.push(LedgerOp::SettleLocked {
                    from: *participant,
                    to: self.escrow_account,
                    amount: *amount,
                });
                Ok(*amount)
            }
            StakeOp::Payout {
                pool,
                recipient,
                amount,
            } => {
                self.pay_from_pool(overlay, pool, recipient, *amount, ledger_ops)
            }
            StakeOp::Drain { pool, recipient } => {
                let amount = overlay.pool(pool);
                self.pay_from_pool(overlay, pool, recipient, amount, ledger_ops)
            }
        }
    }

    fn pay_from_pool(
        &self,
        overlay: &mut Overlay<'_>,
        pool: &BeneficiaryPool,
        recipient: &AgentId,
        amount: TokenAmount,
        ledger_ops: &mut Vec<LedgerOp>,
    ) -> Result<TokenAmount> {
        if amount.is_zero() {
            return Ok(TokenAmount::ZERO);
        }
        let available = overlay.pool(pool);
        let remaining = available
            .checked_sub(amount)
            .ok_or(CrpcError::PoolUnderflow {
                requested: amount,
                available,
            })?;
        overlay.pools.insert(*pool, remaining);
        if recipient != &self.escrow_account {
            ledger_ops.push(LedgerOp::Transfer {
                from: self.escrow_account,
                to: *recipient,
                amount,
            });
        }
        Ok(amount)
    }

    pub fn lock(&self, participant: AgentId, scope: StakeScope, amount: TokenAmount) -> Result<()> {
        self.execute(&[StakeOp::Lock {
            participant,
            scope,
            amount,
        }])?;
        debug!(
            participant = %short_hex(participant.as_bytes()),
            amount = %amount,
            "🔒 Stake locked"
        );
        Ok(())
    }

    /// Idempotent: a second release of the same lock returns zero.
    pub fn release(&self, participant: AgentId, scope: StakeScope) -> Result<TokenAmount> {
        let moved = self.execute(&[StakeOp::Release { participant, scope }])?;
        Ok(moved.first().copied().unwrap_or_default())
    }

    pub fn slash(
        &self,
        participant: AgentId,
        scope: StakeScope,
        amount: TokenAmount,
        pool: BeneficiaryPool,
    ) -> Result<()> {
        self.execute(&[StakeOp::Slash {
            participant,
            scope,
            amount,
            pool,
        }])?;
        info!(
            participant = %short_hex(participant.as_bytes()),
            amount = %amount,
            pool = ?pool.kind,
            "⚔️ Stake slashed"
        );
        Ok(())
    }

    pub fn payout(&self, pool: BeneficiaryPool, recipient: AgentId, amount: TokenAmount) -> Result<()> {
        self.execute(&[StakeOp::Payout {
            pool,
            recipient,
            amount,
        }])?;
        Ok(())
    }

    pub fn refund(&self, pool: BeneficiaryPool, recipient: AgentId) -> Result<TokenAmount> {
        let moved = self.execute(&[StakeOp::Drain { pool, recipient }])?;
        Ok(moved.first().copied().unwrap_or_default())
    }

    /// Direct transfer between two accounts outside any scope.
    pub fn transfer(&self, from: AgentId, to: AgentId, amount: TokenAmount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let _book = self.book.lock();
        self.ledger
            .apply_batch(&[LedgerOp::Transfer { from, to, amount }])?;
        Ok(())
    }

    pub fn locked_amount(&self, participant: &AgentId, scope: &StakeScope) -> TokenAmount {
        self.book
            .lock()
            .locks
            .get(&(*participant, *scope))
            .copied()
            .unwrap_or_default()
    }

    pub fn total_locked(&self, participant: &AgentId) -> TokenAmount {
        self.book
            .lock()
            .locks
            .iter()
            .filter(|((p, _), _)| p == participant)
            .map(|(_, amount)| *amount)
            .sum()
    }

    pub fn pool_balance(&self, pool: &BeneficiaryPool) -> TokenAmount {
        self.book.lock().pools.get(pool).copied().unwrap_or_default()
    }

    pub fn available(&self, account: &AgentId) -> TokenAmount {
        self.ledger.available(account)
    }
}
