//! Cluster aggregate and the records that hang off it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::config::{GovernanceConfig, TradingConfig};
use crate::error::{ClusterError, Result};
use crate::shares::{self, BasisPoints};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterCategory {
    Micro,
    Neighborhood,
    Industrial,
    Supply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Forming,
    Active,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Coordinator,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    pub contribution_amount: u64,
    pub share_percentage: BasisPoints,
    pub role: MemberRole,
    /// Mirrors `share_percentage`
    pub voting_power: BasisPoints,
    /// Expected kWh per distribution cycle
    pub energy_usage: f64,
    pub is_active: bool,
}

impl Member {
    pub(crate) fn set_share(&mut self, share: BasisPoints) {
        self.share_percentage = share;
        self.voting_power = share;
    }
}

/// Cooperative energy cluster aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub category: ClusterCategory,
    pub location: Location,
    pub members: Vec<Member>,
    pub shared_assets: Vec<SharedAsset>,
    /// Currency units held in common
    pub pooled_funds: u64,
    /// kWh
    pub energy_capacity: f64,
    pub current_generation_rate: f64,
    pub governance: GovernanceConfig,
    pub trading: TradingConfig,
    pub status: ClusterStatus,
    pub reputation_score: f64,
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn member_mut(&mut self, user_id: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.user_id == user_id)
    }

    /// Active member by id, or `NotFound`
    pub fn active_member(&self, user_id: &str) -> Result<&Member> {
        self.member(user_id)
            .filter(|m| m.is_active)
            .ok_or_else(|| {
                ClusterError::NotFound(format!(
                    "active member {} in cluster {}",
                    user_id, self.id
                ))
            })
    }

    /// Active members in membership order
    pub fn active_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_active)
    }

    pub fn active_member_count(&self) -> usize {
        self.active_members().count()
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.member(user_id).is_some()
    }

    /// Check the share-sum and bookkeeping invariants of the aggregate
    pub fn verify_invariants(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for member in &self.members {
            if !seen.insert(member.user_id.as_str()) {
                return Err(ClusterError::InvariantViolation(format!(
                    "duplicate member {} in cluster {}",
                    member.user_id, self.id
                )));
            }
            if member.voting_power != member.share_percentage {
                return Err(ClusterError::InvariantViolation(format!(
                    "voting power of {} diverged from share",
                    member.user_id
                )));
            }
            if !member.is_active && !member.share_percentage.is_zero() {
                return Err(ClusterError::InvariantViolation(format!(
                    "inactive member {} still holds {}",
                    member.user_id, member.share_percentage
                )));
            }
        }

        if self.active_member_count() > 0 {
            let sum = shares::total(self.active_members().map(|m| m.share_percentage));
            if sum != BasisPoints::FULL.0 as u64 {
                return Err(ClusterError::InvariantViolation(format!(
                    "active shares of cluster {} sum to {} bp",
                    self.id, sum
                )));
            }
        }

        if !self.energy_capacity.is_finite() || self.energy_capacity < 0.0 {
            return Err(ClusterError::InvariantViolation(format!(
                "energy capacity {} of cluster {}",
                self.energy_capacity, self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    EquipmentPurchase,
    NewMember,
    Maintenance,
    Budget,
    RulesChange,
}

impl ProposalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalType::EquipmentPurchase => "equipment_purchase",
            ProposalType::NewMember => "new_member",
            ProposalType::Maintenance => "maintenance",
            ProposalType::Budget => "budget",
            ProposalType::RulesChange => "rules_change",
        }
    }
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalType {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "equipment_purchase" => Ok(ProposalType::EquipmentPurchase),
            "new_member" => Ok(ProposalType::NewMember),
            "maintenance" => Ok(ProposalType::Maintenance),
            "budget" => Ok(ProposalType::Budget),
            "rules_change" => Ok(ProposalType::RulesChange),
            other => Err(ClusterError::InvalidProposalType(other.to_string())),
        }
    }
}

/// Type-specific proposal content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposalPayload {
    EquipmentPurchase {
        purchase_id: String,
    },
    NewMember {
        user_id: String,
        contribution: u64,
    },
    Maintenance {
        #[serde(default)]
        asset_id: Option<String>,
        #[serde(default)]
        estimated_cost: u64,
    },
    Budget {
        amount: u64,
    },
    RulesChange,
}

impl ProposalPayload {
    pub fn proposal_type(&self) -> ProposalType {
        match self {
            ProposalPayload::EquipmentPurchase { .. } => ProposalType::EquipmentPurchase,
            ProposalPayload::NewMember { .. } => ProposalType::NewMember,
            ProposalPayload::Maintenance { .. } => ProposalType::Maintenance,
            ProposalPayload::Budget { .. } => ProposalType::Budget,
            ProposalPayload::RulesChange => ProposalType::RulesChange,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Open,
    Passed,
    Rejected,
}

impl DecisionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DecisionStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

impl FromStr for VoteChoice {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yes" => Ok(VoteChoice::Yes),
            "no" => Ok(VoteChoice::No),
            "abstain" => Ok(VoteChoice::Abstain),
            other => Err(ClusterError::InvalidVote(format!("unknown choice '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub member_id: String,
    pub choice: VoteChoice,
    /// Snapshot taken when the vote was cast
    pub voting_power: BasisPoints,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Voting power totals, in basis points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub total: u64,
    pub yes: u64,
    pub no: u64,
    pub abstain: u64,
}

impl Tally {
    /// Yes power as a percent of participating power
    pub fn approval_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.yes as f64 / self.total as f64 * 100.0
    }

    /// Participating power as a percent of the whole cluster
    pub fn participation_percent(&self) -> f64 {
        BasisPoints(self.total as u32).as_percent()
    }
}

/// Governance proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub cluster_id: String,
    pub title: String,
    pub description: String,
    pub proposed_by: String,
    pub proposed_at: DateTime<Utc>,
    pub voting_deadline: DateTime<Utc>,
    pub votes: Vec<Vote>,
    pub status: DecisionStatus,
    pub payload: ProposalPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn proposal_type(&self) -> ProposalType {
        self.payload.proposal_type()
    }

    pub fn tally(&self) -> Tally {
        self.votes.iter().fold(Tally::default(), |mut t, v| {
            let power = v.voting_power.0 as u64;
            t.total += power;
            match v.choice {
                VoteChoice::Yes => t.yes += power,
                VoteChoice::No => t.no += power,
                VoteChoice::Abstain => t.abstain += power,
            }
            t
        })
    }

    /// Linked purchase id for equipment proposals
    pub fn purchase_id(&self) -> Option<&str> {
        match &self.payload {
            ProposalPayload::EquipmentPurchase { purchase_id } => Some(purchase_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentRequest {
    pub asset_type: String,
    pub specification: String,
    pub estimated_cost: u64,
    /// kWh added to cluster capacity once installed
    pub capacity_kwh: f64,
    pub justification: String,
    pub urgency: Urgency,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warranty_years: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: String,
    pub cluster_id: String,
    pub request: EquipmentRequest,
    pub approval_status: ApprovalStatus,
    pub decision_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetOwnership {
    pub member_id: String,
    pub share_percentage: BasisPoints,
    /// Member's contribution at the time of purchase
    pub contribution_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceSchedule {
    pub interval_days: u32,
    pub next_due: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedAsset {
    pub id: String,
    pub asset_type: String,
    pub specification: String,
    pub cost: u64,
    pub capacity: f64,
    /// Frozen at purchase, not updated by later dilution
    pub ownership: Vec<AssetOwnership>,
    pub installation_date: DateTime<Utc>,
    pub warranty_expiry: DateTime<Utc>,
    pub maintenance: MaintenanceSchedule,
}

impl SharedAsset {
    pub fn ownership_of(&self, member_id: &str) -> Option<&AssetOwnership> {
        self.ownership.iter().find(|o| o.member_id == member_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    ContributionBased,
    NeedBased,
    EqualShare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurplusHandling {
    SellExternal,
    StoreBattery,
    MemberCredit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberAllocation {
    pub member_id: String,
    pub allocated_energy: f64,
    pub consumed_energy: f64,
    pub credit_balance: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTrade {
    pub energy: f64,
    pub rate: f64,
    pub value: f64,
}

/// One distribution cycle; history is append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub id: String,
    pub cluster_id: String,
    pub date: DateTime<Utc>,
    pub total_generated: f64,
    pub total_consumed: f64,
    /// Reserve actually held back, capped at generation
    pub reserve_held: f64,
    pub surplus: f64,
    /// Unmet member demand plus any reserve shortfall
    pub deficit: f64,
    pub allocations: Vec<MemberAllocation>,
    pub external_trades: Vec<ExternalTrade>,
    pub battery_storage: f64,
}

impl DistributionRecord {
    pub fn allocation_for(&self, member_id: &str) -> Option<&MemberAllocation> {
        self.allocations.iter().find(|a| a.member_id == member_id)
    }

    pub fn external_sales(&self) -> f64 {
        self.external_trades.iter().map(|t| t.value).sum()
    }
}

/// Half-open reporting window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportingPeriod {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Length in fractional days
    pub fn days(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 86_400.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberReturns {
    pub member_id: String,
    pub period: ReportingPeriod,
    pub energy_received: f64,
    pub energy_value: f64,
    pub cost_savings: f64,
    pub asset_appreciation: f64,
    pub profit_sharing: f64,
    pub total_return: f64,
    pub return_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vote(member: &str, choice: VoteChoice, bp: u32) -> Vote {
        Vote {
            member_id: member.into(),
            choice,
            voting_power: BasisPoints(bp),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            reason: None,
        }
    }

    #[test]
    fn test_tally() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let decision = Decision {
            id: "d1".into(),
            cluster_id: "c1".into(),
            title: "Budget".into(),
            description: String::new(),
            proposed_by: "a".into(),
            proposed_at: now,
            voting_deadline: now,
            votes: vec![
                vote("a", VoteChoice::Yes, 3000),
                vote("b", VoteChoice::No, 2000),
                vote("c", VoteChoice::Abstain, 1000),
            ],
            status: DecisionStatus::Open,
            payload: ProposalPayload::Budget { amount: 10 },
            resolved_at: None,
        };

        let tally = decision.tally();
        assert_eq!(tally.total, 6000);
        assert_eq!(tally.yes, 3000);
        assert_eq!(tally.participation_percent(), 60.0);
        assert_eq!(tally.approval_percent(), 50.0);
        assert_eq!(decision.proposal_type(), ProposalType::Budget);
        assert!(decision.purchase_id().is_none());
    }

    #[test]
    fn test_empty_tally_has_no_approval() {
        assert_eq!(Tally::default().approval_percent(), 0.0);
    }

    #[test]
    fn test_payload_is_tagged() {
        let payload = ProposalPayload::EquipmentPurchase {
            purchase_id: "p1".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "equipment_purchase");
        assert_eq!(json["purchase_id"], "p1");

        let parsed: ProposalPayload =
            serde_json::from_value(serde_json::json!({"type": "rules_change"})).unwrap();
        assert_eq!(parsed.proposal_type(), ProposalType::RulesChange);
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("abstain".parse::<VoteChoice>().unwrap(), VoteChoice::Abstain);
        assert!(matches!(
            "maybe".parse::<VoteChoice>(),
            Err(ClusterError::InvalidVote(_))
        ));
        assert_eq!(
            "rules_change".parse::<ProposalType>().unwrap(),
            ProposalType::RulesChange
        );
        assert!(matches!(
            "party".parse::<ProposalType>(),
            Err(ClusterError::InvalidProposalType(_))
        ));
    }

    #[test]
    fn test_reporting_period() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        let period = ReportingPeriod { start, end };
        assert_eq!(period.days(), 30.0);
        assert!(period.contains(start));
        assert!(!period.contains(end));
    }
}
