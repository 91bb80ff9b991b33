//! Cluster engine: the transactional shell around the ledger modules.
//!
//! Each mutating operation takes the cluster's exclusive lock, loads the
//! cluster's working set from the store, mutates it, verifies invariants and
//! only then saves the collections that changed. A failed operation or a
//! failed verification never reaches `save`. Different clusters only share a
//! short commit lock that serialises whole-collection writes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ClusterConfig, EngineConfig};
use crate::error::{ClusterError, Result, StoreError};
use crate::model::{
    ApprovalStatus, Cluster, Decision, DecisionStatus, DistributionRecord, EquipmentRequest,
    MemberReturns, ProposalPayload, Purchase, ReportingPeriod, VoteChoice,
};
use crate::registry::{field, ClusterRegistry};
use crate::store::{self, to_records, Store};
use crate::{distribution, governance, membership, purchase, returns};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Everything one cluster operation may touch
#[derive(Debug, Clone, PartialEq)]
struct WorkingSet {
    cluster: Cluster,
    decisions: Vec<Decision>,
    purchases: Vec<Purchase>,
    /// Appended on commit
    distributions: Vec<DistributionRecord>,
}

impl WorkingSet {
    fn decision_index(&self, decision_id: &str) -> Result<usize> {
        self.decisions
            .iter()
            .position(|d| d.id == decision_id)
            .ok_or_else(|| {
                ClusterError::NotFound(format!(
                    "decision {} in cluster {}",
                    decision_id, self.cluster.id
                ))
            })
    }

    /// Cluster invariants plus: every passed purchase decision has an
    /// approved purchase whose asset exists.
    fn verify(&self) -> Result<()> {
        self.cluster.verify_invariants()?;
        for decision in &self.decisions {
            let Some(purchase_id) = decision.purchase_id() else {
                continue;
            };
            if decision.status != DecisionStatus::Passed {
                continue;
            }
            let purchase = self
                .purchases
                .iter()
                .find(|p| p.id == purchase_id)
                .ok_or_else(|| {
                    ClusterError::InvariantViolation(format!(
                        "passed decision {} has no purchase {}",
                        decision.id, purchase_id
                    ))
                })?;
            let materialised = purchase.approval_status == ApprovalStatus::Approved
                && purchase.asset_id.as_ref().map_or(false, |asset_id| {
                    self.cluster.shared_assets.iter().any(|a| &a.id == asset_id)
                });
            if !materialised {
                return Err(ClusterError::InvariantViolation(format!(
                    "passed decision {} has no materialised asset",
                    decision.id
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a vote transaction, before mapping to the caller's result
enum VoteOutcome {
    Recorded(Decision),
    Expired(String),
}

pub struct ClusterEngine {
    store: Arc<dyn Store>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    registry: ClusterRegistry,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    commit_lock: Mutex<()>,
}

impl ClusterEngine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = ClusterRegistry::new(store.clone());
        Self {
            store,
            config,
            clock,
            registry,
            locks: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub fn create_cluster(&self, config: &ClusterConfig, founder_id: &str) -> Result<Cluster> {
        let now = self.clock.now();
        let cluster = membership::create_cluster(new_id(), config, &self.config, founder_id, now)?;
        let lock = self.cluster_lock(&cluster.id);
        let _guard = lock.lock();

        let ws = WorkingSet {
            cluster,
            decisions: Vec::new(),
            purchases: Vec::new(),
            distributions: Vec::new(),
        };
        ws.verify()?;
        self.commit(None, &ws)?;
        Ok(ws.cluster)
    }

    pub fn join_cluster(&self, cluster_id: &str, user_id: &str, contribution: u64) -> Result<Cluster> {
        let now = self.clock.now();
        let limits = self.config.membership.clone();
        self.transact(cluster_id, |ws| {
            membership::join_cluster(&mut ws.cluster, user_id, contribution, &limits, now)?;
            Ok(ws.cluster.clone())
        })
    }

    pub fn leave_cluster(&self, cluster_id: &str, user_id: &str) -> Result<Cluster> {
        let limits = self.config.membership.clone();
        self.transact(cluster_id, |ws| {
            membership::leave_cluster(&mut ws.cluster, user_id, &limits)?;
            Ok(ws.cluster.clone())
        })
    }

    pub fn record_energy_usage(&self, cluster_id: &str, user_id: &str, usage_kwh: f64) -> Result<Cluster> {
        self.transact(cluster_id, |ws| {
            membership::record_energy_usage(&mut ws.cluster, user_id, usage_kwh)?;
            Ok(ws.cluster.clone())
        })
    }

    // -----------------------------------------------------------------------
    // Governance
    // -----------------------------------------------------------------------

    /// Open a proposal. Equipment purchases go through
    /// [`ClusterEngine::initiate_group_purchase`] instead.
    pub fn create_proposal(
        &self,
        cluster_id: &str,
        payload: ProposalPayload,
        title: &str,
        description: &str,
        proposed_by: &str,
    ) -> Result<Decision> {
        if matches!(payload, ProposalPayload::EquipmentPurchase { .. }) {
            return Err(ClusterError::InvalidInput(
                "equipment purchases are proposed with initiate_group_purchase".into(),
            ));
        }
        let now = self.clock.now();
        self.transact(cluster_id, |ws| {
            let decision = governance::create_proposal(
                &ws.cluster,
                new_id(),
                payload,
                title,
                description,
                proposed_by,
                now,
            )?;
            ws.decisions.push(decision.clone());
            Ok(decision)
        })
    }

    /// Cast or replace a vote.
    ///
    /// A vote on an expired proposal resolves it (the resolution is committed)
    /// and then fails with `VotingClosed`.
    pub fn vote(
        &self,
        cluster_id: &str,
        decision_id: &str,
        member_id: &str,
        choice: VoteChoice,
        reason: Option<String>,
    ) -> Result<Decision> {
        let now = self.clock.now();
        let outcome = self.transact(cluster_id, |ws| {
            let idx = ws.decision_index(decision_id)?;
            if let Some(status) =
                governance::expire_if_due(&ws.cluster.governance, &mut ws.decisions[idx], now)
            {
                self.settle_expired(ws, idx, status, now)?;
                return Ok(VoteOutcome::Expired(decision_id.to_string()));
            }

            let before = ws.decisions[idx].status;
            let status = governance::cast_vote(
                &ws.cluster,
                &mut ws.decisions[idx],
                member_id,
                choice,
                reason,
                now,
            )?;
            if status != before {
                self.settle(ws, idx, status, now)?;
            }
            Ok(VoteOutcome::Recorded(ws.decisions[idx].clone()))
        })?;

        match outcome {
            VoteOutcome::Recorded(decision) => Ok(decision),
            VoteOutcome::Expired(id) => Err(ClusterError::VotingClosed(id)),
        }
    }

    /// Resolve every open proposal past its deadline, cluster by cluster.
    ///
    /// Returns the decisions that changed state. A cluster whose resolution
    /// fails is left as it was and logged.
    pub fn sweep_expired_proposals(&self) -> Result<Vec<Decision>> {
        let now = self.clock.now();
        let cluster_ids: Vec<String> = self
            .store
            .load(store::CLUSTERS)?
            .iter()
            .filter_map(|r| field(r, "id").map(str::to_string))
            .collect();

        let mut resolved = Vec::new();
        for cluster_id in cluster_ids {
            let swept = self.transact(&cluster_id, |ws| {
                let mut changed = Vec::new();
                for idx in 0..ws.decisions.len() {
                    if let Some(status) = governance::expire_if_due(
                        &ws.cluster.governance,
                        &mut ws.decisions[idx],
                        now,
                    ) {
                        self.settle_expired(ws, idx, status, now)?;
                        changed.push(ws.decisions[idx].clone());
                    }
                }
                Ok(changed)
            });
            match swept {
                Ok(mut batch) => resolved.append(&mut batch),
                Err(e) => warn!(cluster_id = %cluster_id, error = %e, "sweep failed for cluster"),
            }
        }

        if !resolved.is_empty() {
            info!(resolved = resolved.len(), "expired proposals swept");
        }
        Ok(resolved)
    }

    // -----------------------------------------------------------------------
    // Purchases
    // -----------------------------------------------------------------------

    pub fn initiate_group_purchase(
        &self,
        cluster_id: &str,
        request: EquipmentRequest,
        proposed_by: &str,
    ) -> Result<(Purchase, Decision)> {
        let now = self.clock.now();
        self.transact(cluster_id, |ws| {
            let (purchase, decision) = purchase::initiate_group_purchase(
                &ws.cluster,
                new_id(),
                new_id(),
                request,
                proposed_by,
                now,
            )?;
            ws.purchases.push(purchase.clone());
            ws.decisions.push(decision.clone());
            Ok((purchase, decision))
        })
    }

    // -----------------------------------------------------------------------
    // Distribution and returns
    // -----------------------------------------------------------------------

    pub fn distribute_energy(&self, cluster_id: &str, total_generated: f64) -> Result<DistributionRecord> {
        let now = self.clock.now();
        self.transact(cluster_id, |ws| {
            let record =
                distribution::distribute_energy(&mut ws.cluster, new_id(), total_generated, now)?;
            ws.distributions.push(record.clone());
            Ok(record)
        })
    }

    pub fn calculate_member_returns(
        &self,
        cluster_id: &str,
        period: ReportingPeriod,
    ) -> Result<Vec<MemberReturns>> {
        let cluster = self.registry.get_cluster_by_id(cluster_id)?;
        let history = self.registry.distribution_history(cluster_id)?;
        returns::calculate_member_returns(
            &cluster,
            &history,
            period,
            self.config.returns.annual_appreciation_rate,
        )
    }

    pub fn member_returns(
        &self,
        cluster_id: &str,
        member_id: &str,
        period: ReportingPeriod,
    ) -> Result<MemberReturns> {
        let cluster = self.registry.get_cluster_by_id(cluster_id)?;
        let history = self.registry.distribution_history(cluster_id)?;
        returns::member_returns(
            &cluster,
            &history,
            member_id,
            period,
            self.config.returns.annual_appreciation_rate,
        )
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Apply the side effects of a decision reaching a terminal state
    fn settle(
        &self,
        ws: &mut WorkingSet,
        idx: usize,
        status: DecisionStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(purchase_id) = ws.decisions[idx].purchase_id().map(str::to_string) else {
            return Ok(());
        };
        let linked = ws
            .purchases
            .iter_mut()
            .find(|p| p.id == purchase_id)
            .ok_or_else(|| {
                ClusterError::InvariantViolation(format!(
                    "decision {} links missing purchase {}",
                    ws.decisions[idx].id, purchase_id
                ))
            })?;

        match status {
            DecisionStatus::Passed => {
                purchase::complete_purchase(
                    &mut ws.cluster,
                    linked,
                    &ws.decisions[idx],
                    new_id(),
                    &self.config.assets,
                    now,
                )?;
            }
            DecisionStatus::Rejected => purchase::reject_purchase(linked),
            DecisionStatus::Open => {}
        }
        Ok(())
    }

    /// Settle a decision resolved at its deadline. A purchase that passed but
    /// can no longer be paid for is rejected instead.
    fn settle_expired(
        &self,
        ws: &mut WorkingSet,
        idx: usize,
        status: DecisionStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self.settle(ws, idx, status, now) {
            Err(ClusterError::InsufficientFunds { required, available }) => {
                warn!(
                    cluster_id = %ws.cluster.id,
                    decision_id = %ws.decisions[idx].id,
                    required,
                    available,
                    "passed purchase unaffordable at deadline, rejecting"
                );
                ws.decisions[idx].status = DecisionStatus::Rejected;
                self.settle(ws, idx, DecisionStatus::Rejected, now)
            }
            other => other,
        }
    }

    fn cluster_lock(&self, cluster_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(cluster_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `op` on the cluster's working set under its lock and commit the
    /// result if invariants hold
    fn transact<T, F>(&self, cluster_id: &str, op: F) -> Result<T>
    where
        F: FnOnce(&mut WorkingSet) -> Result<T>,
    {
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock();

        let original = self.load_working_set(cluster_id)?;
        let mut ws = original.clone();
        let value = op(&mut ws)?;

        if let Err(e) = ws.verify() {
            warn!(cluster_id = %cluster_id, error = %e, "commit aborted");
            return Err(e);
        }
        self.commit(Some(&original), &ws)?;
        Ok(value)
    }

    fn load_working_set(&self, cluster_id: &str) -> Result<WorkingSet> {
        let cluster = self.registry.get_cluster_by_id(cluster_id)?;
        Ok(WorkingSet {
            cluster,
            decisions: self.registry.decisions_for(cluster_id)?,
            purchases: self.registry.purchases_for(cluster_id)?,
            distributions: Vec::new(),
        })
    }

    /// Save the collections that differ from `original`; dependent
    /// collections first, the cluster record last. If any save fails, every
    /// collection already written is restored in reverse order.
    fn commit(&self, original: Option<&WorkingSet>, ws: &WorkingSet) -> Result<()> {
        if original == Some(ws) {
            return Ok(());
        }
        let _guard = self.commit_lock.lock();

        let mut written: Vec<(&'static str, Vec<Value>)> = Vec::new();
        let outcome = self.write_changes(original, ws, &mut written);
        if let Err(e) = &outcome {
            for (collection, previous) in written.into_iter().rev() {
                if let Err(restore) = self.store.save(collection, previous) {
                    error!(
                        cluster_id = %ws.cluster.id,
                        collection,
                        error = %restore,
                        "rollback failed"
                    );
                }
            }
            warn!(cluster_id = %ws.cluster.id, error = %e, "commit rolled back");
        }
        outcome
    }

    /// Records the pre-commit contents of each collection in `written`
    /// before saving over it
    fn write_changes(
        &self,
        original: Option<&WorkingSet>,
        ws: &WorkingSet,
        written: &mut Vec<(&'static str, Vec<Value>)>,
    ) -> Result<()> {
        let cluster_id = ws.cluster.id.as_str();

        if original.map_or(true, |o| o.decisions != ws.decisions) {
            let previous = self.store.load(store::DECISIONS)?;
            let next = replace_for_cluster(&previous, cluster_id, to_records(&ws.decisions)?);
            written.push((store::DECISIONS, previous));
            self.store.save(store::DECISIONS, next)?;
        }
        if original.map_or(true, |o| o.purchases != ws.purchases) {
            let previous = self.store.load(store::PURCHASES)?;
            let next = replace_for_cluster(&previous, cluster_id, to_records(&ws.purchases)?);
            written.push((store::PURCHASES, previous));
            self.store.save(store::PURCHASES, next)?;
        }
        if !ws.distributions.is_empty() {
            let previous = self.store.load(store::DISTRIBUTIONS)?;
            let mut next = previous.clone();
            next.extend(to_records(&ws.distributions)?);
            written.push((store::DISTRIBUTIONS, previous));
            self.store.save(store::DISTRIBUTIONS, next)?;
        }
        if original.map_or(true, |o| o.cluster != ws.cluster) {
            let record = serde_json::to_value(&ws.cluster).map_err(StoreError::from)?;
            let previous = self.store.load(store::CLUSTERS)?;
            let mut next = previous.clone();
            match next.iter_mut().find(|r| field(r, "id") == Some(cluster_id)) {
                Some(existing) => *existing = record,
                None => next.push(record),
            }
            written.push((store::CLUSTERS, previous));
            self.store.save(store::CLUSTERS, next)?;
        }
        Ok(())
    }
}

fn replace_for_cluster(records: &[Value], cluster_id: &str, mine: Vec<Value>) -> Vec<Value> {
    records
        .iter()
        .filter(|r| field(r, "cluster_id") != Some(cluster_id))
        .cloned()
        .chain(mine)
        .collect()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::membership::tests::{cluster_config, founded, now};
    use crate::shares::BasisPoints;
    use crate::store::{MemoryStore, MockStore};
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn engine() -> (ClusterEngine, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(now()));
        let engine = ClusterEngine::with_clock(
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
            clock.clone(),
        );
        (engine, clock)
    }

    #[test]
    fn test_create_and_join() {
        let (engine, _) = engine();
        let cluster = engine.create_cluster(&cluster_config(2000), "founder").unwrap();
        let joined = engine.join_cluster(&cluster.id, "bob", 2000).unwrap();

        assert_eq!(joined.pooled_funds, 4000);
        let stored = engine.registry().get_cluster_by_id(&cluster.id).unwrap();
        assert_eq!(stored, joined);
        assert_eq!(stored.member("founder").unwrap().share_percentage, BasisPoints(5000));
    }

    #[test]
    fn test_failed_join_leaves_store_untouched() {
        let (engine, _) = engine();
        let cluster = engine.create_cluster(&cluster_config(2000), "founder").unwrap();
        engine.join_cluster(&cluster.id, "bob", 500).unwrap();
        let before = engine.registry().get_cluster_by_id(&cluster.id).unwrap();

        let err = engine.join_cluster(&cluster.id, "bob", 500).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateMembership);
        assert_eq!(engine.registry().get_cluster_by_id(&cluster.id).unwrap(), before);
    }

    #[test]
    fn test_unknown_cluster() {
        let (engine, _) = engine();
        let err = engine.join_cluster("missing", "bob", 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_equipment_proposal_must_use_purchase_flow() {
        let (engine, _) = engine();
        let cluster = engine.create_cluster(&cluster_config(2000), "founder").unwrap();
        let err = engine
            .create_proposal(
                &cluster.id,
                ProposalPayload::EquipmentPurchase {
                    purchase_id: "p".into(),
                },
                "t",
                "",
                "founder",
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_vote_on_expired_proposal_commits_rejection() {
        let (engine, clock) = engine();
        let cluster = engine.create_cluster(&cluster_config(2000), "founder").unwrap();
        engine.join_cluster(&cluster.id, "bob", 2000).unwrap();
        let decision = engine
            .create_proposal(&cluster.id, ProposalPayload::RulesChange, "Quiet hours", "", "bob")
            .unwrap();

        clock.advance(Duration::days(30));
        let err = engine
            .vote(&cluster.id, &decision.id, "bob", VoteChoice::Yes, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VotingClosed);

        let stored = engine.registry().get_decision(&cluster.id, &decision.id).unwrap();
        assert_eq!(stored.status, DecisionStatus::Rejected);
        assert!(stored.votes.is_empty());
    }

    #[test]
    fn test_unaffordable_purchase_rejected_at_deadline() {
        let (engine, clock) = engine();
        let cluster = engine.create_cluster(&cluster_config(2000), "founder").unwrap();
        let request = EquipmentRequest {
            asset_type: "panel".into(),
            specification: "4 x 400 W".into(),
            estimated_cost: 1500,
            capacity_kwh: 6.0,
            justification: "Roof space".into(),
            urgency: crate::model::Urgency::Low,
            requested_by: "founder".into(),
            warranty_years: None,
        };
        let (purchase, mut decision) = engine
            .initiate_group_purchase(&cluster.id, request, "founder")
            .unwrap();

        // a passing vote on record while funds were drained elsewhere
        decision.votes.push(crate::model::Vote {
            member_id: "founder".into(),
            choice: VoteChoice::Yes,
            voting_power: BasisPoints::FULL,
            timestamp: now(),
            reason: None,
        });
        engine
            .store
            .save(store::DECISIONS, to_records(&[decision.clone()]).unwrap())
            .unwrap();
        let mut drained = engine.registry().get_cluster_by_id(&cluster.id).unwrap();
        drained.pooled_funds = 1000;
        engine
            .store
            .save(store::CLUSTERS, to_records(&[drained]).unwrap())
            .unwrap();

        clock.advance(Duration::hours(73));
        let swept = engine.sweep_expired_proposals().unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, DecisionStatus::Rejected);

        let purchases = engine.registry().purchases_for(&cluster.id).unwrap();
        assert_eq!(purchases[0].id, purchase.id);
        assert_eq!(purchases[0].approval_status, ApprovalStatus::Rejected);
        let stored = engine.registry().get_cluster_by_id(&cluster.id).unwrap();
        assert_eq!(stored.pooled_funds, 1000);
        assert!(stored.shared_assets.is_empty());
    }

    /// Memory store whose saves to one collection fail while armed
    struct FailingSaves {
        inner: MemoryStore,
        collection: &'static str,
        armed: AtomicBool,
    }

    impl Store for FailingSaves {
        fn load(&self, collection: &str) -> std::result::Result<Vec<Value>, StoreError> {
            self.inner.load(collection)
        }

        fn save(&self, collection: &str, records: Vec<Value>) -> std::result::Result<(), StoreError> {
            if collection == self.collection && self.armed.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.save(collection, records)
        }
    }

    #[test]
    fn test_failed_cluster_save_rolls_back_commit() {
        let backend = Arc::new(FailingSaves {
            inner: MemoryStore::new(),
            collection: store::CLUSTERS,
            armed: AtomicBool::new(false),
        });
        let engine = ClusterEngine::with_clock(
            backend.clone(),
            EngineConfig::default(),
            Arc::new(FixedClock::new(now())),
        );
        let cluster = engine.create_cluster(&cluster_config(2000), "founder").unwrap();
        let request = EquipmentRequest {
            asset_type: "battery".into(),
            specification: "5 kWh".into(),
            estimated_cost: 500,
            capacity_kwh: 5.0,
            justification: "Night load".into(),
            urgency: crate::model::Urgency::Medium,
            requested_by: "founder".into(),
            warranty_years: None,
        };
        let (purchase, decision) = engine
            .initiate_group_purchase(&cluster.id, request, "founder")
            .unwrap();

        backend.armed.store(true, Ordering::SeqCst);
        let err = engine
            .vote(&cluster.id, &decision.id, "founder", VoteChoice::Yes, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);

        let registry = engine.registry();
        let stored = registry.get_decision(&cluster.id, &decision.id).unwrap();
        assert_eq!(stored.status, DecisionStatus::Open);
        assert!(stored.votes.is_empty());
        assert_eq!(
            registry.purchases_for(&cluster.id).unwrap()[0].approval_status,
            ApprovalStatus::Pending
        );
        let unchanged = registry.get_cluster_by_id(&cluster.id).unwrap();
        assert_eq!(unchanged.pooled_funds, 2000);
        assert!(unchanged.shared_assets.is_empty());

        // the cluster keeps working once storage recovers
        backend.armed.store(false, Ordering::SeqCst);
        engine.join_cluster(&cluster.id, "bob", 1000).unwrap();
        let passed = engine
            .vote(&cluster.id, &decision.id, "founder", VoteChoice::Yes, None)
            .unwrap();
        assert_eq!(passed.status, DecisionStatus::Passed);
        assert_eq!(
            registry.purchases_for(&cluster.id).unwrap()[0].id,
            purchase.id
        );
        assert_eq!(registry.get_cluster_by_id(&cluster.id).unwrap().pooled_funds, 2500);
    }

    #[test]
    fn test_out_of_range_governance_override_rejected() {
        let (engine, _) = engine();
        let mut config = cluster_config(2000);
        let mut governance = EngineConfig::default().governance;
        governance
            .proposal_rules
            .get_mut(&crate::model::ProposalType::Budget)
            .unwrap()
            .discussion_period_hours = i64::MAX / 2;
        config.governance = Some(governance);

        let err = engine.create_cluster(&config, "founder").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(engine.registry().all_clusters().unwrap().is_empty());
    }

    #[test]
    fn test_invariant_violation_never_saves() {
        let mut corrupt = founded(1000);
        corrupt.members[0].set_share(BasisPoints(9000));
        let record = serde_json::to_value(&corrupt).unwrap();

        let mut mock = MockStore::new();
        mock.expect_load().returning(move |collection| {
            if collection == store::CLUSTERS {
                Ok(vec![record.clone()])
            } else {
                Ok(Vec::new())
            }
        });
        mock.expect_save().times(0);

        let engine = ClusterEngine::with_clock(
            Arc::new(mock),
            EngineConfig::default(),
            Arc::new(FixedClock::new(now())),
        );
        let err = engine.record_energy_usage("c1", "founder", 5.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[test]
    fn test_unchanged_working_set_skips_save() {
        let record = serde_json::to_value(founded(1000)).unwrap();
        let mut mock = MockStore::new();
        mock.expect_load().returning(move |collection| {
            if collection == store::CLUSTERS {
                Ok(vec![record.clone()])
            } else {
                Ok(Vec::new())
            }
        });
        mock.expect_save().times(0);

        let engine = ClusterEngine::with_clock(
            Arc::new(mock),
            EngineConfig::default(),
            Arc::new(FixedClock::new(now())),
        );
        assert!(engine.sweep_expired_proposals().unwrap().is_empty());
    }
}
