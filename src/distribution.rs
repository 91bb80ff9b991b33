//! Per-cycle energy distribution.
//!
//! Reserve is held back first (never more than was generated), the remainder
//! is allocated to active members in membership order under the cluster's
//! allocation policy, and whatever is left after consumption is dispatched
//! per the surplus policy.
//!
//! No policy hands out more than the energy left after the reserve, and a
//! member never consumes more than its allocation, so
//! `sum(allocated) + reserve_held <= total_generated` always holds. When
//! demand plus reserve exceeds generation, consumption is capped at each
//! allocation and the unmet demand (plus any reserve shortfall) is recorded
//! as `deficit`. Nothing is borrowed, imported or taken from the reserve.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{ClusterError, Result};
use crate::model::{
    AllocationPolicy, Cluster, DistributionRecord, ExternalTrade, Member, MemberAllocation,
    SurplusHandling,
};
use crate::shares::BasisPoints;

/// Tolerance for the energy conservation check, kWh
pub const EPSILON: f64 = 1e-6;

/// Headroom granted over a member's usage under need-based allocation
const NEED_HEADROOM: f64 = 1.1;

/// Run one distribution cycle over `total_generated` kWh
pub fn distribute_energy(
    cluster: &mut Cluster,
    id: String,
    total_generated: f64,
    now: DateTime<Utc>,
) -> Result<DistributionRecord> {
    if !total_generated.is_finite() || total_generated < 0.0 {
        return Err(ClusterError::InvalidInput(format!(
            "generated energy {} must be non-negative",
            total_generated
        )));
    }

    let trading = cluster.trading.clone();
    let reserve_held = trading.minimum_reserve.min(total_generated);
    let available = total_generated - reserve_held;

    let members: Vec<&Member> = cluster.active_members().collect();
    let allocated = allocate(&members, available, trading.allocation_policy);

    let mut allocations = Vec::with_capacity(members.len());
    let mut total_consumed = 0.0;
    let mut total_demand = 0.0;
    for (member, &allocated_energy) in members.iter().zip(allocated.iter()) {
        let consumed_energy = allocated_energy.min(member.energy_usage);
        total_consumed += consumed_energy;
        total_demand += member.energy_usage;
        allocations.push(MemberAllocation {
            member_id: member.user_id.clone(),
            allocated_energy,
            consumed_energy,
            credit_balance: allocated_energy - consumed_energy,
            cost: consumed_energy * trading.internal_rate,
        });
    }

    let surplus = (total_generated - total_consumed - reserve_held).max(0.0);
    let deficit = (total_demand - total_consumed).max(0.0)
        + (trading.minimum_reserve - reserve_held);

    let mut external_trades = Vec::new();
    let mut battery_storage = 0.0;
    if surplus > EPSILON {
        match trading.surplus_handling {
            SurplusHandling::SellExternal => external_trades.push(ExternalTrade {
                energy: surplus,
                rate: trading.external_rate,
                value: surplus * trading.external_rate,
            }),
            SurplusHandling::StoreBattery => battery_storage = surplus,
            SurplusHandling::MemberCredit => {
                if !allocations.is_empty() {
                    let credit = surplus / allocations.len() as f64;
                    allocations
                        .iter_mut()
                        .for_each(|a| a.credit_balance += credit);
                }
            }
        }
    }

    let allocated_total: f64 = allocations.iter().map(|a| a.allocated_energy).sum();
    if allocated_total + reserve_held > total_generated + EPSILON {
        return Err(ClusterError::InvariantViolation(format!(
            "allocated {:.6} kWh plus reserve {:.6} exceeds generation {:.6}",
            allocated_total, reserve_held, total_generated
        )));
    }

    if deficit > EPSILON {
        warn!(
            cluster_id = %cluster.id,
            deficit,
            demand = total_demand,
            generated = total_generated,
            "distribution cycle ran short"
        );
    }

    cluster.current_generation_rate = total_generated;

    let record = DistributionRecord {
        id,
        cluster_id: cluster.id.clone(),
        date: now,
        total_generated,
        total_consumed,
        reserve_held,
        surplus,
        deficit,
        allocations,
        external_trades,
        battery_storage,
    };

    info!(
        cluster_id = %cluster.id,
        generated = total_generated,
        consumed = total_consumed,
        surplus,
        policy = ?trading.allocation_policy,
        "energy distributed"
    );
    Ok(record)
}

fn allocate(members: &[&Member], available: f64, policy: AllocationPolicy) -> Vec<f64> {
    if members.is_empty() {
        return Vec::new();
    }
    let equal = available / members.len() as f64;
    members
        .iter()
        .map(|m| match policy {
            AllocationPolicy::ContributionBased => {
                available * m.share_percentage.0 as f64 / BasisPoints::FULL.0 as f64
            }
            AllocationPolicy::NeedBased => (m.energy_usage * NEED_HEADROOM).min(equal),
            AllocationPolicy::EqualShare => equal,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MembershipConfig;
    use crate::membership::tests::{founded, now};
    use crate::membership::{join_cluster, record_energy_usage};

    /// founder 50 %, b 30 %, c 20 %, reserve 50 kWh
    fn cluster(policy: AllocationPolicy, surplus: SurplusHandling) -> Cluster {
        let limits = MembershipConfig::default();
        let mut cluster = founded(5000);
        join_cluster(&mut cluster, "b", 3000, &limits, now()).unwrap();
        join_cluster(&mut cluster, "c", 2000, &limits, now()).unwrap();
        cluster.trading.minimum_reserve = 50.0;
        cluster.trading.internal_rate = 0.10;
        cluster.trading.external_rate = 0.20;
        cluster.trading.allocation_policy = policy;
        cluster.trading.surplus_handling = surplus;
        cluster
    }

    fn allocated(record: &DistributionRecord) -> Vec<f64> {
        record.allocations.iter().map(|a| a.allocated_energy).collect()
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_contribution_based_allocation() {
        let mut cluster = cluster(AllocationPolicy::ContributionBased, SurplusHandling::SellExternal);
        let record = distribute_energy(&mut cluster, "r1".into(), 500.0, now()).unwrap();

        assert_eq!(allocated(&record), vec![225.0, 135.0, 90.0]);
        let sum: f64 = allocated(&record).iter().sum();
        assert_close(sum + 50.0, 500.0);
        assert_eq!(record.reserve_held, 50.0);
        assert_eq!(cluster.current_generation_rate, 500.0);
    }

    #[test]
    fn test_consumption_cost_and_credit() {
        let mut cluster = cluster(AllocationPolicy::ContributionBased, SurplusHandling::SellExternal);
        record_energy_usage(&mut cluster, "founder", 200.0).unwrap();
        record_energy_usage(&mut cluster, "b", 150.0).unwrap();
        record_energy_usage(&mut cluster, "c", 40.0).unwrap();

        let record = distribute_energy(&mut cluster, "r1".into(), 500.0, now()).unwrap();
        let founder = record.allocation_for("founder").unwrap();
        assert_close(founder.consumed_energy, 200.0);
        assert_close(founder.credit_balance, 25.0);
        assert_close(founder.cost, 20.0);

        let b = record.allocation_for("b").unwrap();
        assert_close(b.consumed_energy, 135.0);
        assert_close(b.credit_balance, 0.0);

        assert_close(record.total_consumed, 375.0);
        assert_close(record.surplus, 75.0);
        // b wanted 15 kWh more than it got
        assert_close(record.deficit, 15.0);
        assert_eq!(record.external_trades.len(), 1);
        assert_close(record.external_trades[0].value, 15.0);
        assert_close(record.external_sales(), 15.0);
    }

    #[test]
    fn test_need_based_caps_at_equal_split() {
        let mut cluster = cluster(AllocationPolicy::NeedBased, SurplusHandling::StoreBattery);
        record_energy_usage(&mut cluster, "founder", 500.0).unwrap();
        record_energy_usage(&mut cluster, "b", 100.0).unwrap();
        record_energy_usage(&mut cluster, "c", 0.0).unwrap();

        let record = distribute_energy(&mut cluster, "r1".into(), 500.0, now()).unwrap();
        let got = allocated(&record);
        assert_close(got[0], 150.0);
        assert_close(got[1], 110.0);
        assert_close(got[2], 0.0);
        assert_close(record.battery_storage, 500.0 - 250.0 - 50.0);
        assert!(record.external_trades.is_empty());
    }

    #[test]
    fn test_equal_share_with_member_credit() {
        let mut cluster = cluster(AllocationPolicy::EqualShare, SurplusHandling::MemberCredit);
        let record = distribute_energy(&mut cluster, "r1".into(), 350.0, now()).unwrap();

        for allocation in &record.allocations {
            assert_close(allocation.allocated_energy, 100.0);
            // 100 unconsumed plus 300 / 3 surplus credit
            assert_close(allocation.credit_balance, 200.0);
        }
        assert_close(record.surplus, 300.0);
    }

    #[test]
    fn test_generation_below_reserve() {
        let mut cluster = cluster(AllocationPolicy::ContributionBased, SurplusHandling::SellExternal);
        record_energy_usage(&mut cluster, "b", 10.0).unwrap();
        let record = distribute_energy(&mut cluster, "r1".into(), 30.0, now()).unwrap();

        assert_eq!(record.reserve_held, 30.0);
        assert!(allocated(&record).iter().all(|a| *a == 0.0));
        assert_eq!(record.surplus, 0.0);
        // 10 kWh unmet plus 20 kWh of reserve shortfall
        assert_close(record.deficit, 30.0);
        assert!(record.external_trades.is_empty());
    }

    #[test]
    fn test_demand_above_generation_records_deficit() {
        for policy in [
            AllocationPolicy::ContributionBased,
            AllocationPolicy::NeedBased,
            AllocationPolicy::EqualShare,
        ] {
            let mut cluster = cluster(policy, SurplusHandling::SellExternal);
            record_energy_usage(&mut cluster, "founder", 200.0).unwrap();
            record_energy_usage(&mut cluster, "b", 200.0).unwrap();
            record_energy_usage(&mut cluster, "c", 200.0).unwrap();

            // 600 kWh demand plus 50 kWh reserve against 350 kWh generated
            let record = distribute_energy(&mut cluster, "r1".into(), 350.0, now()).unwrap();
            assert_eq!(record.reserve_held, 50.0);
            assert_close(record.total_consumed, 300.0);
            for allocation in &record.allocations {
                assert_close(allocation.consumed_energy, allocation.allocated_energy);
                assert_close(allocation.credit_balance, 0.0);
            }
            assert_close(record.deficit, 300.0);
            assert_close(record.surplus, 0.0);
            assert!(record.external_trades.is_empty());
        }
    }

    #[test]
    fn test_zero_generation() {
        let mut cluster = cluster(AllocationPolicy::EqualShare, SurplusHandling::SellExternal);
        let record = distribute_energy(&mut cluster, "r1".into(), 0.0, now()).unwrap();
        assert_eq!(record.total_consumed, 0.0);
        assert_eq!(record.reserve_held, 0.0);
    }

    #[test]
    fn test_rejects_invalid_generation() {
        let mut cluster = cluster(AllocationPolicy::EqualShare, SurplusHandling::SellExternal);
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let err = distribute_energy(&mut cluster, "r".into(), bad, now()).unwrap_err();
            assert!(matches!(err, ClusterError::InvalidInput(_)));
        }
    }

    #[test]
    fn test_conservation_across_policies() {
        for policy in [
            AllocationPolicy::ContributionBased,
            AllocationPolicy::NeedBased,
            AllocationPolicy::EqualShare,
        ] {
            let mut cluster = cluster(policy, SurplusHandling::SellExternal);
            record_energy_usage(&mut cluster, "founder", 91.3).unwrap();
            record_energy_usage(&mut cluster, "b", 402.7).unwrap();
            for generated in [0.0, 12.5, 50.0, 333.3, 1_000.0] {
                let record = distribute_energy(&mut cluster, "r".into(), generated, now()).unwrap();
                let sum: f64 = allocated(&record).iter().sum();
                assert!(sum + record.reserve_held <= generated + EPSILON);
            }
        }
    }
}
