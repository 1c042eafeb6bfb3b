use crate::error::{CrpcError, Result};
use crate::stake::{StakeLedger, StakeScope};
use crpc_economics::TokenAmount;
use crpc_types::{short_hex, AgentId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistration {
    pub validator: AgentId,
    pub locked_stake: TokenAmount,
    pub active: bool,
    pub registered_at: u64,
    /// Comparison commitments on tasks not yet finalized.
    pub open_commitments: u32,
    pub times_slashed: u32,
}

/// Validators that may commit comparisons, each backed by a registration stake.
pub struct ValidatorRegistry {
    stakes: Arc<StakeLedger>,
    registrations: RwLock<HashMap<AgentId, ValidatorRegistration>>,
}

impl ValidatorRegistry {
    pub fn new(stakes: Arc<StakeLedger>) -> Self {
        Self {
            stakes,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        validator: AgentId,
        stake: TokenAmount,
        minimum_stake: TokenAmount,
        now: u64,
    ) -> Result<()> {
        if stake < minimum_stake {
            return Err(CrpcError::StakeBelowMinimum {
                required: minimum_stake,
                provided: stake,
            });
        }

        let mut registrations = self.registrations.write();
        if registrations.contains_key(&validator) {
            return Err(CrpcError::ValidatorAlreadyRegistered(validator.to_hex()));
        }

        self.stakes
            .lock(validator, StakeScope::Registration, stake)?;
        registrations.insert(
            validator,
            ValidatorRegistration {
                validator,
                locked_stake: stake,
                active: true,
                registered_at: now,
                open_commitments: 0,
                times_slashed: 0,
            },
        );

        info!(
            validator = %short_hex(validator.as_bytes()),
            stake = %stake,
            "🛡️ Validator registered"
        );
        Ok(())
    }

    /// Add stake; reactivates the validator once it clears the minimum again.
    pub fn top_up(
        &self,
        validator: AgentId,
        amount: TokenAmount,
        minimum_stake: TokenAmount,
    ) -> Result<TokenAmount> {
        let mut registrations = self.registrations.write();
        let registration = registrations
            .get_mut(&validator)
            .ok_or_else(|| CrpcError::ValidatorNotRegistered(validator.to_hex()))?;

        self.stakes
            .lock(validator, StakeScope::Registration, amount)?;
        registration.locked_stake = registration.locked_stake.saturating_add(amount);
        if registration.locked_stake >= minimum_stake {
            registration.active = true;
        }
        Ok(registration.locked_stake)
    }

    /// Withdraw entirely. Refused while any task commitment is unfinalized.
    pub fn deregister(&self, validator: AgentId) -> Result<TokenAmount> {
        let mut registrations = self.registrations.write();
        let registration = registrations
            .get(&validator)
            .ok_or_else(|| CrpcError::ValidatorNotRegistered(validator.to_hex()))?;
        if registration.open_commitments > 0 {
            return Err(CrpcError::ValidatorBusy {
                validator: validator.to_hex(),
                open_commitments: registration.open_commitments,
            });
        }

        let released = self.stakes.release(validator, StakeScope::Registration)?;
        registrations.remove(&validator);
        info!(
            validator = %short_hex(validator.as_bytes()),
            released = %released,
            "Validator deregistered"
        );
        Ok(released)
    }

    pub fn is_active(&self, validator: &AgentId, minimum_stake: TokenAmount) -> bool {
        self.registrations
            .read()
            .get(validator)
            .map(|r| r.active && r.locked_stake >= minimum_stake)
            .unwrap_or(false)
    }

    /// Check eligibility and count a new task commitment in one step, so a
    /// concurrent deregistration cannot slip in between.
    pub fn begin_commitment(&self, validator: &AgentId, minimum_stake: TokenAmount) -> Result<()> {
        let mut registrations = self.registrations.write();
        let registration = registrations
            .get_mut(validator)
            .ok_or_else(|| CrpcError::ValidatorNotRegistered(validator.to_hex()))?;
        if !registration.active || registration.locked_stake < minimum_stake {
            return Err(CrpcError::ValidatorInactive(validator.to_hex()));
        }
        registration.open_commitments = registration.open_commitments.saturating_add(1);
        Ok(())
    }

    pub fn end_commitment(&self, validator: &AgentId) {
        if let Some(r) = self.registrations.write().get_mut(validator) {
            r.open_commitments = r.open_commitments.saturating_sub(1);
        }
    }

    /// Share of the registration stake that a `bps` slash would take. Include it
    /// in a larger batch, then call [`Self::record_slash`] once the batch commits.
    pub fn slash_amount(&self, validator: &AgentId, bps: u16) -> TokenAmount {
        self.registrations
            .read()
            .get(validator)
            .map(|r| r.locked_stake.mul_bps(bps))
            .unwrap_or_default()
    }

    pub fn record_slash(&self, validator: &AgentId, amount: TokenAmount, minimum_stake: TokenAmount) {
        let mut registrations = self.registrations.write();
        if let Some(r) = registrations.get_mut(validator) {
            r.locked_stake = r.locked_stake.saturating_sub(amount);
            r.times_slashed += 1;
            if r.locked_stake < minimum_stake {
                r.active = false;
                warn!(
                    validator = %short_hex(validator.as_bytes()),
                    remaining = %r.locked_stake,
                    "Validator deactivated below minimum stake"
                );
            }
        }
    }

    pub fn get(&self, validator: &AgentId) -> Option<ValidatorRegistration> {
        self.registrations.read().get(validator).cloned()
    }

    pub fn active_validators(&self, minimum_stake: TokenAmount) -> Vec<AgentId> {
        let mut active: Vec<AgentId> = self
            .registrations
            .read()
            .values()
            .filter(|r| r.active && r.locked_stake >= minimum_stake)
            .map(|r| r.validator)
            .collect();
        active.sort();
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stake::{BeneficiaryPool, StakeOp};
    use crpc_economics::{BalanceManager, TokenLedger};
    use crpc_types::TaskId;

    fn setup() -> (Arc<BalanceManager>, Arc<StakeLedger>, ValidatorRegistry, AgentId) {
        let balances = Arc::new(BalanceManager::new());
        let validator = AgentId::derive(b"validator");
        balances
            .credit(validator, TokenAmount::from_tokens(1_000))
            .unwrap();
        let stakes = Arc::new(StakeLedger::new(balances.clone(), AgentId::derive(b"escrow")));
        let registry = ValidatorRegistry::new(stakes.clone());
        (balances, stakes, registry, validator)
    }

    #[test]
    fn test_register_below_minimum() {
        let (_, _, registry, validator) = setup();
        let err = registry
            .register(
                validator,
                TokenAmount::from_tokens(50),
                TokenAmount::from_tokens(100),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, CrpcError::StakeBelowMinimum { .. }));
    }

    #[test]
    fn test_register_and_deregister() {
        let (balances, _, registry, validator) = setup();
        let min = TokenAmount::from_tokens(100);
        registry
            .register(validator, TokenAmount::from_tokens(150), min, 0)
            .unwrap();
        assert!(registry.is_active(&validator, min));
        assert_eq!(balances.locked(&validator), TokenAmount::from_tokens(150));

        assert!(matches!(
            registry.register(validator, min, min, 1),
            Err(CrpcError::ValidatorAlreadyRegistered(_))
        ));

        registry.begin_commitment(&validator, min).unwrap();
        assert!(matches!(
            registry.deregister(validator),
            Err(CrpcError::ValidatorBusy { .. })
        ));
        registry.end_commitment(&validator);

        assert_eq!(
            registry.deregister(validator).unwrap(),
            TokenAmount::from_tokens(150)
        );
        assert_eq!(balances.locked(&validator), TokenAmount::ZERO);
        assert!(registry.get(&validator).is_none());
    }

    #[test]
    fn test_slash_deactivates_then_top_up_reactivates() {
        let (balances, stakes, registry, validator) = setup();
        let min = TokenAmount::from_tokens(100);
        let task = TaskId::derive(&validator, 0, "t");
        let pool = BeneficiaryPool::validator_forfeits(task);
        registry.register(validator, min, min, 0).unwrap();

        let slashed = registry.slash_amount(&validator, 1_000);
        assert_eq!(slashed, TokenAmount::from_tokens(10));
        stakes
            .execute(&[StakeOp::Slash {
                participant: validator,
                scope: StakeScope::Registration,
                amount: slashed,
                pool,
            }])
            .unwrap();
        registry.record_slash(&validator, slashed, min);
        assert_eq!(stakes.pool_balance(&pool), TokenAmount::from_tokens(10));
        assert_eq!(balances.balance(&validator), TokenAmount::from_tokens(990));
        assert!(!registry.is_active(&validator, min));
        assert!(matches!(
            registry.begin_commitment(&validator, min),
            Err(CrpcError::ValidatorInactive(_))
        ));

        registry
            .top_up(validator, TokenAmount::from_tokens(10), min)
            .unwrap();
        assert!(registry.is_active(&validator, min));
        assert_eq!(registry.get(&validator).unwrap().times_slashed, 1);
    }
}
