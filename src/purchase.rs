//! Group equipment purchases bound to governance decisions.

use chrono::{DateTime, Duration, Months, Utc};
use tracing::{info, warn};

use crate::config::{AssetConfig, MAX_WARRANTY_YEARS};
use crate::error::{ClusterError, Result};
use crate::governance;
use crate::model::{
    ApprovalStatus, AssetOwnership, Cluster, Decision, DecisionStatus, EquipmentRequest,
    MaintenanceSchedule, ProposalPayload, Purchase, SharedAsset,
};

/// Create a pending purchase and the `equipment_purchase` proposal deciding it
pub fn initiate_group_purchase(
    cluster: &Cluster,
    purchase_id: String,
    decision_id: String,
    request: EquipmentRequest,
    proposed_by: &str,
    now: DateTime<Utc>,
) -> Result<(Purchase, Decision)> {
    if request.asset_type.trim().is_empty() {
        return Err(ClusterError::InvalidInput("asset type is empty".into()));
    }
    if request.estimated_cost == 0 {
        return Err(ClusterError::InvalidInput(
            "estimated cost must be positive".into(),
        ));
    }
    if !request.capacity_kwh.is_finite() || request.capacity_kwh < 0.0 {
        return Err(ClusterError::InvalidInput(format!(
            "capacity {} must be non-negative",
            request.capacity_kwh
        )));
    }
    if request.warranty_years.map_or(false, |y| y > MAX_WARRANTY_YEARS) {
        return Err(ClusterError::InvalidInput(format!(
            "warranty above {} years",
            MAX_WARRANTY_YEARS
        )));
    }
    if request.estimated_cost > cluster.pooled_funds {
        return Err(ClusterError::InsufficientFunds {
            required: request.estimated_cost,
            available: cluster.pooled_funds,
        });
    }

    let decision = governance::create_proposal(
        cluster,
        decision_id,
        ProposalPayload::EquipmentPurchase {
            purchase_id: purchase_id.clone(),
        },
        &format!("Purchase {}", request.asset_type),
        &request.justification,
        proposed_by,
        now,
    )?;

    let purchase = Purchase {
        id: purchase_id,
        cluster_id: cluster.id.clone(),
        request,
        approval_status: ApprovalStatus::Pending,
        decision_id: decision.id.clone(),
        purchase_date: None,
        asset_id: None,
    };

    info!(
        cluster_id = %cluster.id,
        purchase_id = %purchase.id,
        decision_id = %decision.id,
        cost = purchase.request.estimated_cost,
        "group purchase proposed"
    );
    Ok((purchase, decision))
}

/// Materialise the asset for a passed purchase decision.
///
/// Snapshots current ownership, spends the cost from pooled funds and adds
/// the asset's capacity to the cluster.
pub fn complete_purchase(
    cluster: &mut Cluster,
    purchase: &mut Purchase,
    decision: &Decision,
    asset_id: String,
    assets: &AssetConfig,
    now: DateTime<Utc>,
) -> Result<SharedAsset> {
    if decision.status != DecisionStatus::Passed {
        return Err(ClusterError::InvariantViolation(format!(
            "decision {} has not passed",
            decision.id
        )));
    }
    if decision.purchase_id() != Some(purchase.id.as_str()) {
        return Err(ClusterError::InvariantViolation(format!(
            "decision {} is not linked to purchase {}",
            decision.id, purchase.id
        )));
    }
    if purchase.approval_status != ApprovalStatus::Pending {
        return Err(ClusterError::InvariantViolation(format!(
            "purchase {} already {:?}",
            purchase.id, purchase.approval_status
        )));
    }

    let cost = purchase.request.estimated_cost;
    let remaining = cluster
        .pooled_funds
        .checked_sub(cost)
        .ok_or(ClusterError::InsufficientFunds {
            required: cost,
            available: cluster.pooled_funds,
        })?;

    let ownership: Vec<AssetOwnership> = cluster
        .active_members()
        .map(|m| AssetOwnership {
            member_id: m.user_id.clone(),
            share_percentage: m.share_percentage,
            contribution_amount: m.contribution_amount,
        })
        .collect();

    let warranty_years = purchase
        .request
        .warranty_years
        .unwrap_or(assets.default_warranty_years);
    let warranty_expiry = now
        .checked_add_months(Months::new(warranty_years.saturating_mul(12)))
        .ok_or_else(|| {
            ClusterError::InvalidInput(format!("warranty of {} years is out of range", warranty_years))
        })?;
    let next_due = Duration::try_days(i64::from(assets.maintenance_interval_days))
        .and_then(|interval| now.checked_add_signed(interval))
        .ok_or_else(|| {
            ClusterError::InvalidInput(format!(
                "maintenance interval of {} days is out of range",
                assets.maintenance_interval_days
            ))
        })?;

    let asset = SharedAsset {
        id: asset_id,
        asset_type: purchase.request.asset_type.clone(),
        specification: purchase.request.specification.clone(),
        cost,
        capacity: purchase.request.capacity_kwh,
        ownership,
        installation_date: now,
        warranty_expiry,
        maintenance: MaintenanceSchedule {
            interval_days: assets.maintenance_interval_days,
            next_due,
        },
    };

    cluster.pooled_funds = remaining;
    cluster.energy_capacity += asset.capacity;
    cluster.shared_assets.push(asset.clone());

    purchase.approval_status = ApprovalStatus::Approved;
    purchase.purchase_date = Some(now);
    purchase.asset_id = Some(asset.id.clone());

    info!(
        cluster_id = %cluster.id,
        purchase_id = %purchase.id,
        asset_id = %asset.id,
        cost,
        funds = cluster.pooled_funds,
        capacity = cluster.energy_capacity,
        "purchase completed"
    );
    Ok(asset)
}

/// Mark a purchase rejected after its decision failed
pub fn reject_purchase(purchase: &mut Purchase) {
    if purchase.approval_status == ApprovalStatus::Pending {
        purchase.approval_status = ApprovalStatus::Rejected;
        warn!(purchase_id = %purchase.id, "purchase rejected");
    }
}
