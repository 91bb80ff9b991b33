//! Governance engine: proposal lifecycle, voting and resolution.
//!
//! A decision moves `open -> passed | rejected` and never leaves a terminal
//! state. Resolution runs after every vote (early pass) and when the deadline
//! is swept (reject on timeout unless both quorum and approval hold).

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::config::GovernanceConfig;
use crate::error::{ClusterError, Result};
use crate::model::{Cluster, Decision, DecisionStatus, ProposalPayload, Tally, Vote, VoteChoice};

const MAX_REASON_LEN: usize = 1000;

/// Open a new proposal on `cluster`
pub fn create_proposal(
    cluster: &Cluster,
    id: String,
    payload: ProposalPayload,
    title: &str,
    description: &str,
    proposed_by: &str,
    now: DateTime<Utc>,
) -> Result<Decision> {
    let proposal_type = payload.proposal_type();
    let rules = cluster.governance.rules_for(proposal_type).ok_or_else(|| {
        ClusterError::InvalidProposalType(format!(
            "{} is not configured for cluster {}",
            proposal_type, cluster.id
        ))
    })?;
    cluster.active_member(proposed_by)?;
    if title.trim().is_empty() {
        return Err(ClusterError::InvalidInput("proposal title is empty".into()));
    }

    let voting_deadline = Duration::try_hours(rules.discussion_period_hours)
        .and_then(|period| now.checked_add_signed(period))
        .ok_or_else(|| {
            ClusterError::InvalidInput(format!(
                "{} discussion period of {}h is out of range",
                proposal_type, rules.discussion_period_hours
            ))
        })?;

    let decision = Decision {
        id,
        cluster_id: cluster.id.clone(),
        title: title.to_string(),
        description: description.to_string(),
        proposed_by: proposed_by.to_string(),
        proposed_at: now,
        voting_deadline,
        votes: Vec::new(),
        status: DecisionStatus::Open,
        payload,
        resolved_at: None,
    };

    info!(
        cluster_id = %cluster.id,
        decision_id = %decision.id,
        proposal_type = %proposal_type,
        deadline = %decision.voting_deadline,
        "proposal created"
    );
    Ok(decision)
}

/// Record `member_id`'s vote, replacing any earlier one, and resolve early
/// if quorum and approval are both met. Returns the decision's status.
///
/// Expired decisions are not resolved here; run [`expire_if_due`] first.
pub fn cast_vote(
    cluster: &Cluster,
    decision: &mut Decision,
    member_id: &str,
    choice: VoteChoice,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<DecisionStatus> {
    if decision.status.is_terminal() || now >= decision.voting_deadline {
        return Err(ClusterError::VotingClosed(decision.id.clone()));
    }
    let member = cluster.active_member(member_id)?;
    if member.voting_power.is_zero() {
        return Err(ClusterError::InvalidVote(format!(
            "{} holds no voting power",
            member_id
        )));
    }
    if reason.as_ref().map_or(false, |r| r.len() > MAX_REASON_LEN) {
        return Err(ClusterError::InvalidVote(format!(
            "reason longer than {} bytes",
            MAX_REASON_LEN
        )));
    }

    let vote = Vote {
        member_id: member_id.to_string(),
        choice,
        voting_power: member.voting_power,
        timestamp: now,
        reason,
    };
    decision.votes.retain(|v| v.member_id != member_id);
    decision.votes.push(vote);

    debug!(
        decision_id = %decision.id,
        member_id = %member_id,
        choice = ?choice,
        power = %member.voting_power,
        "vote recorded"
    );

    if passes(&cluster.governance, decision) {
        resolve(decision, DecisionStatus::Passed, now);
    }
    Ok(decision.status)
}

/// Resolve an open decision whose deadline has passed.
///
/// Returns the new status, or `None` if nothing changed.
pub fn expire_if_due(
    governance: &GovernanceConfig,
    decision: &mut Decision,
    now: DateTime<Utc>,
) -> Option<DecisionStatus> {
    if decision.status.is_terminal() || now < decision.voting_deadline {
        return None;
    }
    let status = if passes(governance, decision) {
        DecisionStatus::Passed
    } else {
        DecisionStatus::Rejected
    };
    resolve(decision, status, now);
    Some(status)
}

/// Participating power meets the cluster quorum
pub fn quorum_met(governance: &GovernanceConfig, tally: &Tally) -> bool {
    // quorum is in percent, tally in basis points
    tally.total > 0 && tally.total as f64 >= governance.quorum_requirement * 100.0
}

/// Yes power meets `required_approval` percent of participating power
pub fn approval_met(required_approval: f64, tally: &Tally) -> bool {
    tally.total > 0 && tally.yes as f64 * 100.0 >= required_approval * tally.total as f64
}

/// Both quorum and the type's approval threshold hold
pub fn passes(governance: &GovernanceConfig, decision: &Decision) -> bool {
    let Some(rules) = governance.rules_for(decision.proposal_type()) else {
        return false;
    };
    let tally = decision.tally();
    quorum_met(governance, &tally) && approval_met(rules.required_approval, &tally)
}

fn resolve(decision: &mut Decision, status: DecisionStatus, now: DateTime<Utc>) {
    let tally = decision.tally();
    decision.status = status;
    decision.resolved_at = Some(now);
    info!(
        cluster_id = %decision.cluster_id,
        decision_id = %decision.id,
        status = ?status,
        participation = tally.participation_percent(),
        approval = tally.approval_percent(),
        "decision resolved"
    );
}
