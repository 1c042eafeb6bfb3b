use crate::error::{CrpcError, Result};
use crate::types::{MAX_SUBMISSIONS_HARD_CAP, MAX_VALIDATORS_HARD_CAP};
use crpc_economics::{TokenAmount, BASIS_POINTS};
use crpc_types::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakeConfig {
    /// Locked by an author per work commitment.
    pub submission_stake: TokenAmount,
    /// Locked by a validator per comparison commitment.
    pub validator_task_stake: TokenAmount,
    /// Registration stake required to stay active.
    pub minimum_validator_stake: TokenAmount,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            submission_stake: TokenAmount::from_tokens(10),
            validator_task_stake: TokenAmount::from_tokens(20),
            minimum_validator_stake: TokenAmount::from_tokens(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_submissions: usize,
    pub max_validators: usize,
    pub max_artifact_ref_len: usize,
    pub max_secret_len: usize,
    pub max_description_len: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_submissions: MAX_SUBMISSIONS_HARD_CAP,
            max_validators: 64,
            max_artifact_ref_len: 512,
            max_secret_len: 256,
            max_description_len: 4_096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardsConfig {
    pub winner_share_bps: u16,
    pub validator_share_bps: u16,
    /// Bonuses for rank 2 and rank 3, paid from `incentive_pool` when it can afford them.
    pub runner_up_bonuses: Vec<TokenAmount>,
    pub incentive_pool: Option<AgentId>,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            winner_share_bps: 7_000,
            validator_share_bps: 3_000,
            runner_up_bonuses: vec![TokenAmount::from_tokens(5), TokenAmount::from_tokens(2)],
            incentive_pool: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisputeConfig {
    /// Disputes are disabled when no resolver is set.
    pub resolver: Option<AgentId>,
    /// Share of a dishonest validator's registration stake slashed on resolution.
    pub dishonesty_slash_bps: u16,
}

impl Default for DisputeConfig {
    fn default() -> Self {
        Self {
            resolver: None,
            dishonesty_slash_bps: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Holds slashed stake and beneficiary pools until distribution.
    pub escrow_account: AgentId,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            escrow_account: AgentId::derive(b"crpc-escrow"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// One of "pretty", "compact" or "json".
    pub format: String,
    pub file_output: Option<String>,
    pub module_filters: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
            module_filters: BTreeMap::new(),
        }
    }
}

/// Protocol parameters. Held as an immutable snapshot; tasks copy what they
/// need at creation so later updates never touch in-flight tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub stakes: StakeConfig,
    pub limits: LimitsConfig,
    pub rewards: RewardsConfig,
    pub disputes: DisputeConfig,
    pub accounts: AccountsConfig,
    pub logging: LoggingConfig,
}

impl ProtocolConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let rewards = &self.rewards;
        if rewards.winner_share_bps as u64 + rewards.validator_share_bps as u64 != BASIS_POINTS {
            return Err(CrpcError::InvalidConfiguration(format!(
                "winner_share_bps ({}) + validator_share_bps ({}) must equal {}",
                rewards.winner_share_bps, rewards.validator_share_bps, BASIS_POINTS
            )));
        }
        if rewards.runner_up_bonuses.len() > 2 {
            return Err(CrpcError::InvalidConfiguration(
                "at most two runner-up bonuses (rank 2 and rank 3)".to_string(),
            ));
        }
        if rewards.incentive_pool == Some(self.accounts.escrow_account) {
            return Err(CrpcError::InvalidConfiguration(
                "incentive pool must differ from the escrow account".to_string(),
            ));
        }

        let limits = &self.limits;
        if limits.max_submissions == 0 || limits.max_submissions > MAX_SUBMISSIONS_HARD_CAP {
            return Err(CrpcError::InvalidConfiguration(format!(
                "max_submissions must be in 1..={}",
                MAX_SUBMISSIONS_HARD_CAP
            )));
        }
        if limits.max_validators == 0 || limits.max_validators > MAX_VALIDATORS_HARD_CAP {
            return Err(CrpcError::InvalidConfiguration(format!(
                "max_validators must be in 1..={}",
                MAX_VALIDATORS_HARD_CAP
            )));
        }
        if limits.max_artifact_ref_len == 0
            || limits.max_secret_len == 0
            || limits.max_description_len == 0
        {
            return Err(CrpcError::InvalidConfiguration(
                "length limits must be non-zero".to_string(),
            ));
        }

        if self.disputes.dishonesty_slash_bps as u64 > BASIS_POINTS {
            return Err(CrpcError::InvalidConfiguration(format!(
                "dishonesty_slash_bps must not exceed {}",
                BASIS_POINTS
            )));
        }
        if self.disputes.resolver == Some(self.accounts.escrow_account) {
            return Err(CrpcError::InvalidConfiguration(
                "dispute resolver must differ from the escrow account".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `CRPC_*` environment variable overrides. Amounts are in base units.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(stake) = env::var("CRPC_SUBMISSION_STAKE") {
            if let Ok(units) = stake.parse() {
                self.stakes.submission_stake = TokenAmount::from_base_units(units);
            }
        }
        if let Ok(stake) = env::var("CRPC_VALIDATOR_TASK_STAKE") {
            if let Ok(units) = stake.parse() {
                self.stakes.validator_task_stake = TokenAmount::from_base_units(units);
            }
        }
        if let Ok(stake) = env::var("CRPC_MIN_VALIDATOR_STAKE") {
            if let Ok(units) = stake.parse() {
                self.stakes.minimum_validator_stake = TokenAmount::from_base_units(units);
            }
        }

        if let Ok(max) = env::var("CRPC_MAX_SUBMISSIONS") {
            if let Ok(val) = max.parse() {
                self.limits.max_submissions = val;
            }
        }
        if let Ok(max) = env::var("CRPC_MAX_VALIDATORS") {
            if let Ok(val) = max.parse() {
                self.limits.max_validators = val;
            }
        }

        if let Ok(resolver) = env::var("CRPC_DISPUTE_RESOLVER") {
            if let Ok(id) = resolver.parse() {
                self.disputes.resolver = Some(id);
            }
        }
        if let Ok(pool) = env::var("CRPC_INCENTIVE_POOL") {
            if let Ok(id) = pool.parse() {
                self.rewards.incentive_pool = Some(id);
            }
        }

        if let Ok(level) = env::var("CRPC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("CRPC_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProtocolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_split_must_sum_to_whole() {
        let mut config = ProtocolConfig::default();
        config.rewards.winner_share_bps = 8_000;
        assert!(matches!(
            config.validate(),
            Err(CrpcError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_submission_cap_enforced() {
        let mut config = ProtocolConfig::default();
        config.limits.max_submissions = MAX_SUBMISSIONS_HARD_CAP + 1;
        assert!(config.validate().is_err());
        config.limits.max_submissions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ProtocolConfig = toml::from_str(
            r#"
            [limits]
            max_submissions = 5

            [rewards]
            runner_up_bonuses = []
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_submissions, 5);
        assert_eq!(config.limits.max_validators, 64);
        assert!(config.rewards.runner_up_bonuses.is_empty());
        assert_eq!(config.rewards.winner_share_bps, 7_000);
    }

    #[test]
    fn test_env_override() {
        let mut config = ProtocolConfig::default();
        env::set_var("CRPC_MAX_VALIDATORS", "7");
        config.apply_env_overrides();
        env::remove_var("CRPC_MAX_VALIDATORS");
        assert_eq!(config.limits.max_validators, 7);
    }
}
