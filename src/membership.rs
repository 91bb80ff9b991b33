//! Membership ledger: founding, joining with dilution, leaving, usage.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{ClusterConfig, EngineConfig, MembershipConfig};
use crate::error::{ClusterError, Result};
use crate::model::{Cluster, ClusterStatus, Member, MemberRole};
use crate::shares::{self, BasisPoints};

const INITIAL_REPUTATION: f64 = 50.0;

/// Found a cluster with `founder_id` as sole coordinator holding 100 %
pub fn create_cluster(
    id: String,
    config: &ClusterConfig,
    defaults: &EngineConfig,
    founder_id: &str,
    now: DateTime<Utc>,
) -> Result<Cluster> {
    if config.name.trim().is_empty() {
        return Err(ClusterError::InvalidInput("cluster name is empty".into()));
    }
    if founder_id.trim().is_empty() {
        return Err(ClusterError::InvalidInput("founder id is empty".into()));
    }
    if config.location.region.trim().is_empty() {
        return Err(ClusterError::InvalidInput("region is empty".into()));
    }
    if !config.energy_capacity.is_finite() || config.energy_capacity < 0.0 {
        return Err(ClusterError::InvalidInput(format!(
            "energy capacity {} must be non-negative",
            config.energy_capacity
        )));
    }

    let governance = config
        .governance
        .clone()
        .unwrap_or_else(|| defaults.governance.clone());
    governance
        .validate()
        .map_err(|e| ClusterError::InvalidInput(e.to_string()))?;
    let trading = config
        .trading
        .clone()
        .unwrap_or_else(|| defaults.trading.clone());
    trading
        .validate()
        .map_err(|e| ClusterError::InvalidInput(e.to_string()))?;

    let founder = Member {
        user_id: founder_id.to_string(),
        joined_at: now,
        contribution_amount: config.initial_funding,
        share_percentage: BasisPoints::FULL,
        role: MemberRole::Coordinator,
        voting_power: BasisPoints::FULL,
        energy_usage: 0.0,
        is_active: true,
    };

    let cluster = Cluster {
        id,
        name: config.name.clone(),
        category: config.category,
        location: config.location.clone(),
        members: vec![founder],
        shared_assets: Vec::new(),
        pooled_funds: config.initial_funding,
        energy_capacity: config.energy_capacity,
        current_generation_rate: 0.0,
        governance,
        trading,
        status: ClusterStatus::Forming,
        reputation_score: INITIAL_REPUTATION,
        created_at: now,
    };

    info!(
        cluster_id = %cluster.id,
        founder = %founder_id,
        funds = cluster.pooled_funds,
        "cluster created"
    );
    Ok(cluster)
}

/// Add `user_id` with `contribution`, diluting every active member
pub fn join_cluster(
    cluster: &mut Cluster,
    user_id: &str,
    contribution: u64,
    limits: &MembershipConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(ClusterError::InvalidInput("user id is empty".into()));
    }
    if contribution == 0 {
        return Err(ClusterError::InvalidInput(
            "contribution must be positive".into(),
        ));
    }
    if cluster.member(user_id).map_or(false, |m| m.is_active) {
        return Err(ClusterError::DuplicateMembership {
            cluster_id: cluster.id.clone(),
            user_id: user_id.to_string(),
        });
    }
    if cluster.active_member_count() >= limits.max_members {
        return Err(ClusterError::InvalidInput(format!(
            "cluster {} is full ({} members)",
            cluster.id, limits.max_members
        )));
    }
    let new_total = cluster
        .pooled_funds
        .checked_add(contribution)
        .ok_or_else(|| ClusterError::InvalidInput("pooled funds overflow".into()))?;

    let existing: Vec<usize> = active_indices(cluster);
    let old_shares: Vec<BasisPoints> = existing
        .iter()
        .map(|&i| cluster.members[i].share_percentage)
        .collect();
    let remainder_to = remainder_holder(cluster, &existing).unwrap_or(0);

    let new_shares = shares::dilute(&old_shares, cluster.pooled_funds, contribution, remainder_to)
        .ok_or_else(|| {
            ClusterError::InvariantViolation(format!(
                "cannot apportion shares in cluster {}",
                cluster.id
            ))
        })?;

    for (&idx, &share) in existing.iter().zip(new_shares.iter()) {
        cluster.members[idx].set_share(share);
    }
    let joiner_share = new_shares[existing.len()];

    match cluster.member_mut(user_id) {
        Some(former) => {
            former.is_active = true;
            former.contribution_amount += contribution;
            former.set_share(joiner_share);
        }
        None => cluster.members.push(Member {
            user_id: user_id.to_string(),
            joined_at: now,
            contribution_amount: contribution,
            share_percentage: joiner_share,
            role: MemberRole::Member,
            voting_power: joiner_share,
            energy_usage: 0.0,
            is_active: true,
        }),
    }
    cluster.pooled_funds = new_total;
    refresh_status(cluster, limits);

    info!(
        cluster_id = %cluster.id,
        member_id = %user_id,
        contribution,
        share = %joiner_share,
        funds = cluster.pooled_funds,
        "member joined"
    );
    Ok(())
}

/// Deactivate `user_id` and hand its share to the remaining members pro rata
pub fn leave_cluster(
    cluster: &mut Cluster,
    user_id: &str,
    limits: &MembershipConfig,
) -> Result<()> {
    cluster.active_member(user_id)?;
    if cluster.active_member_count() == 1 {
        return Err(ClusterError::InvalidInput(format!(
            "{} is the last active member of cluster {}",
            user_id, cluster.id
        )));
    }

    let leaver_idx = cluster
        .members
        .iter()
        .position(|m| m.user_id == user_id)
        .ok_or_else(|| ClusterError::NotFound(format!("member {}", user_id)))?;
    let was_coordinator = cluster.members[leaver_idx].role == MemberRole::Coordinator;
    {
        let leaver = &mut cluster.members[leaver_idx];
        leaver.is_active = false;
        leaver.role = MemberRole::Member;
        leaver.set_share(BasisPoints::ZERO);
    }

    let remaining = active_indices(cluster);
    if was_coordinator && remainder_holder(cluster, &remaining).is_none() {
        let successor = remaining[0];
        cluster.members[successor].role = MemberRole::Coordinator;
        info!(
            cluster_id = %cluster.id,
            coordinator = %cluster.members[successor].user_id,
            "coordinator role handed over"
        );
    }

    let mut weights: Vec<u128> = remaining
        .iter()
        .map(|&i| cluster.members[i].share_percentage.0 as u128)
        .collect();
    if weights.iter().all(|w| *w == 0) {
        weights.iter_mut().for_each(|w| *w = 1);
    }
    let remainder_to = remainder_holder(cluster, &remaining).unwrap_or(0);
    let new_shares = shares::apportion(&weights, remainder_to).ok_or_else(|| {
        ClusterError::InvariantViolation(format!(
            "cannot redistribute shares in cluster {}",
            cluster.id
        ))
    })?;
    for (&idx, &share) in remaining.iter().zip(new_shares.iter()) {
        cluster.members[idx].set_share(share);
    }
    refresh_status(cluster, limits);

    info!(cluster_id = %cluster.id, member_id = %user_id, "member left");
    Ok(())
}

/// Set the expected per-cycle consumption of an active member
pub fn record_energy_usage(cluster: &mut Cluster, user_id: &str, usage_kwh: f64) -> Result<()> {
    if !usage_kwh.is_finite() || usage_kwh < 0.0 {
        return Err(ClusterError::InvalidInput(format!(
            "energy usage {} must be non-negative",
            usage_kwh
        )));
    }
    cluster.active_member(user_id)?;
    if let Some(member) = cluster.member_mut(user_id) {
        member.energy_usage = usage_kwh;
    }
    Ok(())
}

fn active_indices(cluster: &Cluster) -> Vec<usize> {
    cluster
        .members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_active)
        .map(|(i, _)| i)
        .collect()
}

/// Position within `indices` of the first active coordinator
fn remainder_holder(cluster: &Cluster, indices: &[usize]) -> Option<usize> {
    indices
        .iter()
        .position(|&i| cluster.members[i].role == MemberRole::Coordinator)
}

fn refresh_status(cluster: &mut Cluster, limits: &MembershipConfig) {
    let count = cluster.active_member_count();
    let next = if count >= limits.max_members {
        ClusterStatus::Full
    } else if count >= limits.activation_threshold || cluster.status == ClusterStatus::Full {
        ClusterStatus::Active
    } else {
        cluster.status
    };
    if next != cluster.status {
        info!(
            cluster_id = %cluster.id,
            from = ?cluster.status,
            to = ?next,
            active_members = count,
            "cluster status changed"
        );
        cluster.status = next;
    }
}
