//! Member-level financial returns over a reporting period.

use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::model::{Cluster, DistributionRecord, Member, MemberReturns, ReportingPeriod};

const DAYS_PER_YEAR: f64 = 365.0;

/// Returns for every active member; fails on the first zero contribution
pub fn calculate_member_returns(
    cluster: &Cluster,
    history: &[DistributionRecord],
    period: ReportingPeriod,
    annual_appreciation_rate: f64,
) -> Result<Vec<MemberReturns>> {
    validate_period(&period)?;
    let records = in_period(cluster, history, &period);
    cluster
        .active_members()
        .map(|m| returns_for(cluster, &records, m, period, annual_appreciation_rate))
        .collect()
}

/// Returns for a single member. Former members are included: they keep
/// their recorded allocations and their frozen stake in shared assets.
pub fn member_returns(
    cluster: &Cluster,
    history: &[DistributionRecord],
    member_id: &str,
    period: ReportingPeriod,
    annual_appreciation_rate: f64,
) -> Result<MemberReturns> {
    validate_period(&period)?;
    let member = cluster
        .member(member_id)
        .ok_or_else(|| ClusterError::NotFound(format!("member {}", member_id)))?;
    let records = in_period(cluster, history, &period);
    returns_for(cluster, &records, member, period, annual_appreciation_rate)
}

fn validate_period(period: &ReportingPeriod) -> Result<()> {
    if period.end <= period.start {
        return Err(ClusterError::InvalidInput(format!(
            "reporting period ends ({}) before it starts ({})",
            period.end, period.start
        )));
    }
    Ok(())
}

fn in_period<'a>(
    cluster: &Cluster,
    history: &'a [DistributionRecord],
    period: &ReportingPeriod,
) -> Vec<&'a DistributionRecord> {
    history
        .iter()
        .filter(|r| r.cluster_id == cluster.id && period.contains(r.date))
        .collect()
}

fn returns_for(
    cluster: &Cluster,
    records: &[&DistributionRecord],
    member: &Member,
    period: ReportingPeriod,
    annual_appreciation_rate: f64,
) -> Result<MemberReturns> {
    if member.contribution_amount == 0 {
        return Err(ClusterError::InvalidInput(format!(
            "member {} has no contribution to measure returns against",
            member.user_id
        )));
    }

    let trading = &cluster.trading;
    let energy_received: f64 = records
        .iter()
        .filter_map(|r| r.allocation_for(&member.user_id))
        .map(|a| a.allocated_energy)
        .sum();
    let energy_value = energy_received * trading.external_rate;
    let cost_savings = energy_received * (trading.external_rate - trading.internal_rate);

    let year_fraction = period.days() / DAYS_PER_YEAR;
    let asset_appreciation: f64 = cluster
        .shared_assets
        .iter()
        .filter_map(|asset| {
            asset.ownership_of(&member.user_id).map(|o| {
                o.share_percentage.as_fraction()
                    * asset.cost as f64
                    * annual_appreciation_rate
                    * year_fraction
            })
        })
        .sum();

    let external_sales: f64 = records.iter().map(|r| r.external_sales()).sum();
    let profit_sharing = external_sales * member.share_percentage.as_fraction();

    let total_return = cost_savings + asset_appreciation + profit_sharing;
    let return_percentage = total_return / member.contribution_amount as f64 * 100.0;

    debug!(
        cluster_id = %cluster.id,
        member_id = %member.user_id,
        total_return,
        return_percentage,
        "member returns calculated"
    );

    Ok(MemberReturns {
        member_id: member.user_id.clone(),
        period,
        energy_received,
        energy_value,
        cost_savings,
        asset_appreciation,
        profit_sharing,
        total_return,
        return_percentage,
    })
}
