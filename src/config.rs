use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::model::{AllocationPolicy, ClusterCategory, Location, ProposalType, SurplusHandling};

/// Errors from loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Longest discussion period a proposal type may configure
pub const MAX_DISCUSSION_PERIOD_HOURS: i64 = 24 * 365;

/// Longest maintenance interval, in days
pub const MAX_MAINTENANCE_INTERVAL_DAYS: u32 = 3650;

/// Longest warranty, in years
pub const MAX_WARRANTY_YEARS: u32 = 50;

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persistence backend
    pub store: StoreConfig,

    /// Membership limits
    pub membership: MembershipConfig,

    /// Governance defaults applied to new clusters
    pub governance: GovernanceConfig,

    /// Trading defaults applied to new clusters
    pub trading: TradingConfig,

    /// Member returns reporting
    pub returns: ReturnsConfig,

    /// Shared asset defaults
    pub assets: AssetConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Active members needed before a forming cluster becomes active
    pub activation_threshold: usize,
    /// Active members at which a cluster is full
    pub max_members: usize,
}

/// Voting rules for one proposal type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRules {
    pub discussion_period_hours: i64,
    /// Percent of participating voting power that must vote yes
    pub required_approval: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Minimum participating voting power, in percent of the cluster
    pub quorum_requirement: f64,
    /// Proposal types this cluster accepts
    pub proposal_rules: BTreeMap<ProposalType, ProposalRules>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Price per kWh charged to members
    pub internal_rate: f64,
    /// Price per kWh on the external market
    pub external_rate: f64,
    /// kWh held back from every distribution cycle
    pub minimum_reserve: f64,
    pub allocation_policy: AllocationPolicy,
    pub surplus_handling: SurplusHandling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnsConfig {
    pub annual_appreciation_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub default_warranty_years: u32,
    pub maintenance_interval_days: u32,
}

/// Parameters for founding a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub category: ClusterCategory,
    pub location: Location,
    #[serde(default)]
    pub initial_funding: u64,
    #[serde(default)]
    pub energy_capacity: f64,
    /// Overrides the engine-wide governance defaults
    #[serde(default)]
    pub governance: Option<GovernanceConfig>,
    /// Overrides the engine-wide trading defaults
    #[serde(default)]
    pub trading: Option<TradingConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            dir: PathBuf::from("data"),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 3,
            max_members: 50,
        }
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        let rules = |hours: i64, approval: f64| ProposalRules {
            discussion_period_hours: hours,
            required_approval: approval,
        };
        let mut proposal_rules = BTreeMap::new();
        proposal_rules.insert(ProposalType::EquipmentPurchase, rules(72, 60.0));
        proposal_rules.insert(ProposalType::NewMember, rules(48, 51.0));
        proposal_rules.insert(ProposalType::Maintenance, rules(24, 51.0));
        proposal_rules.insert(ProposalType::Budget, rules(72, 60.0));
        proposal_rules.insert(ProposalType::RulesChange, rules(168, 67.0));
        Self {
            quorum_requirement: 50.0,
            proposal_rules,
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            internal_rate: 0.12,
            external_rate: 0.18,
            minimum_reserve: 50.0,
            allocation_policy: AllocationPolicy::ContributionBased,
            surplus_handling: SurplusHandling::SellExternal,
        }
    }
}

impl Default for ReturnsConfig {
    fn default() -> Self {
        Self {
            annual_appreciation_rate: 0.05,
        }
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            default_warranty_years: 10,
            maintenance_interval_days: 180,
        }
    }
}

impl GovernanceConfig {
    pub fn rules_for(&self, proposal_type: ProposalType) -> Option<&ProposalRules> {
        self.proposal_rules.get(&proposal_type)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.quorum_requirement) {
            return Err(ConfigError::Invalid(format!(
                "quorum_requirement {} outside 0-100",
                self.quorum_requirement
            )));
        }
        for (proposal_type, rules) in &self.proposal_rules {
            if !(1..=MAX_DISCUSSION_PERIOD_HOURS).contains(&rules.discussion_period_hours) {
                return Err(ConfigError::Invalid(format!(
                    "{} discussion period {}h outside 1-{}h",
                    proposal_type, rules.discussion_period_hours, MAX_DISCUSSION_PERIOD_HOURS
                )));
            }
            if !(0.0..=100.0).contains(&rules.required_approval) {
                return Err(ConfigError::Invalid(format!(
                    "{} required_approval {} outside 0-100",
                    proposal_type, rules.required_approval
                )));
            }
        }
        Ok(())
    }
}

impl AssetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_MAINTENANCE_INTERVAL_DAYS).contains(&self.maintenance_interval_days) {
            return Err(ConfigError::Invalid(format!(
                "maintenance_interval_days {} outside 1-{}",
                self.maintenance_interval_days, MAX_MAINTENANCE_INTERVAL_DAYS
            )));
        }
        if self.default_warranty_years > MAX_WARRANTY_YEARS {
            return Err(ConfigError::Invalid(format!(
                "default_warranty_years {} above {}",
                self.default_warranty_years, MAX_WARRANTY_YEARS
            )));
        }
        Ok(())
    }
}

impl TradingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("internal_rate", self.internal_rate),
            ("external_rate", self.external_rate),
            ("minimum_reserve", self.minimum_reserve),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(
            store = ?config.store.kind,
            quorum = config.governance.quorum_requirement,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.membership.activation_threshold == 0 {
            return Err(ConfigError::Invalid(
                "activation_threshold must be at least 1".into(),
            ));
        }
        if self.membership.max_members < self.membership.activation_threshold {
            return Err(ConfigError::Invalid(format!(
                "max_members {} below activation_threshold {}",
                self.membership.max_members, self.membership.activation_threshold
            )));
        }
        if !self.returns.annual_appreciation_rate.is_finite() {
            return Err(ConfigError::Invalid(
                "annual_appreciation_rate must be finite".into(),
            ));
        }
        self.governance.validate()?;
        self.trading.validate()?;
        self.assets.validate()
    }
}
