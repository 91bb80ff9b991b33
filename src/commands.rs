use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::engine::ClusterEngine;
use crate::error::{ClusterError, ErrorKind, StoreError};
use crate::model::{EquipmentRequest, ProposalPayload, ProposalType, ReportingPeriod, VoteChoice};

/// Request from the calling layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Reply to a [`Command`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

/// Command handler result
pub type CommandResult = Result<Value, ClusterError>;

/// Parse a command from raw bytes
pub fn parse_command(payload: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(payload)
}

impl ClusterEngine {
    /// Dispatch a command and wrap the outcome for the caller
    pub fn handle_command(&self, cmd: &Command) -> CommandResponse {
        info!(
            command = %cmd.command,
            request_id = %cmd.request_id,
            "received command"
        );

        let result = match cmd.command.as_str() {
            "create_cluster" => self.handle_create_cluster(cmd),
            "join_cluster" => self.handle_join_cluster(cmd),
            "leave_cluster" => self.handle_leave_cluster(cmd),
            "record_usage" => self.handle_record_usage(cmd),
            "create_proposal" => self.handle_create_proposal(cmd),
            "vote" => self.handle_vote(cmd),
            "sweep" => self.sweep_expired_proposals().and_then(|d| to_json(&d)),
            "initiate_purchase" => self.handle_initiate_purchase(cmd),
            "distribute_energy" => self.handle_distribute_energy(cmd),
            "member_returns" => self.handle_member_returns(cmd),
            "get_cluster" => self.handle_get_cluster(cmd),
            "clusters_by_region" => str_field(&cmd.payload, "region")
                .and_then(|region| self.registry().clusters_by_region(region))
                .and_then(|c| to_json(&c)),
            "clusters_by_member" => str_field(&cmd.payload, "user_id")
                .and_then(|user_id| self.registry().clusters_by_member(user_id))
                .and_then(|c| to_json(&c)),
            "list_decisions" => str_field(&cmd.payload, "cluster_id")
                .and_then(|id| self.registry().decisions_for(id))
                .and_then(|d| to_json(&d)),
            "list_purchases" => str_field(&cmd.payload, "cluster_id")
                .and_then(|id| self.registry().purchases_for(id))
                .and_then(|p| to_json(&p)),
            "distribution_history" => str_field(&cmd.payload, "cluster_id")
                .and_then(|id| self.registry().distribution_history(id))
                .and_then(|h| to_json(&h)),
            _ => {
                warn!(command = %cmd.command, "unknown command");
                Err(ClusterError::InvalidInput(format!(
                    "unknown command: {}",
                    cmd.command
                )))
            }
        };

        match result {
            Ok(value) => CommandResponse {
                request_id: cmd.request_id.clone(),
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(e) => {
                warn!(
                    command = %cmd.command,
                    request_id = %cmd.request_id,
                    error = %e,
                    "command failed"
                );
                CommandResponse {
                    request_id: cmd.request_id.clone(),
                    ok: false,
                    result: None,
                    error: Some(CommandError {
                        kind: e.kind(),
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    fn handle_create_cluster(&self, cmd: &Command) -> CommandResult {
        let founder_id = str_field(&cmd.payload, "founder_id")?;
        let config: ClusterConfig = typed_field(&cmd.payload, "config")?;
        to_json(&self.create_cluster(&config, founder_id)?)
    }

    fn handle_join_cluster(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        let user_id = str_field(&cmd.payload, "user_id")?;
        let contribution = cmd
            .payload
            .get("contribution")
            .and_then(Value::as_u64)
            .ok_or_else(|| missing("contribution"))?;
        to_json(&self.join_cluster(cluster_id, user_id, contribution)?)
    }

    fn handle_leave_cluster(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        let user_id = str_field(&cmd.payload, "user_id")?;
        to_json(&self.leave_cluster(cluster_id, user_id)?)
    }

    fn handle_record_usage(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        let user_id = str_field(&cmd.payload, "user_id")?;
        let usage = f64_field(&cmd.payload, "energy_usage")?;
        to_json(&self.record_energy_usage(cluster_id, user_id, usage)?)
    }

    fn handle_create_proposal(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        let proposed_by = str_field(&cmd.payload, "proposed_by")?;
        let title = str_field(&cmd.payload, "title")?;
        let description = cmd
            .payload
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let proposal = cmd
            .payload
            .get("proposal")
            .ok_or_else(|| missing("proposal"))?;
        // unknown types are a proposal-type error, not a shape error
        let type_name = str_field(proposal, "type")?;
        type_name.parse::<ProposalType>()?;
        let payload: ProposalPayload = serde_json::from_value(proposal.clone())
            .map_err(|e| ClusterError::InvalidInput(format!("proposal: {}", e)))?;

        to_json(&self.create_proposal(cluster_id, payload, title, description, proposed_by)?)
    }

    fn handle_vote(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        let decision_id = str_field(&cmd.payload, "decision_id")?;
        let member_id = str_field(&cmd.payload, "member_id")?;
        let choice: VoteChoice = cmd
            .payload
            .get("choice")
            .and_then(Value::as_str)
            .ok_or_else(|| ClusterError::InvalidVote("missing choice".into()))?
            .parse()?;
        let reason = cmd
            .payload
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        to_json(&self.vote(cluster_id, decision_id, member_id, choice, reason)?)
    }

    fn handle_initiate_purchase(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        let proposed_by = str_field(&cmd.payload, "proposed_by")?;
        let request: EquipmentRequest = typed_field(&cmd.payload, "request")?;
        let (purchase, decision) = self.initiate_group_purchase(cluster_id, request, proposed_by)?;
        Ok(serde_json::json!({
            "purchase": to_json(&purchase)?,
            "decision": to_json(&decision)?,
        }))
    }

    fn handle_distribute_energy(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        let total_generated = f64_field(&cmd.payload, "total_generated")?;
        to_json(&self.distribute_energy(cluster_id, total_generated)?)
    }

    fn handle_member_returns(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        let period: ReportingPeriod = typed_field(&cmd.payload, "period")?;
        match cmd.payload.get("member_id").and_then(Value::as_str) {
            Some(member_id) => to_json(&self.member_returns(cluster_id, member_id, period)?),
            None => to_json(&self.calculate_member_returns(cluster_id, period)?),
        }
    }

    fn handle_get_cluster(&self, cmd: &Command) -> CommandResult {
        let cluster_id = str_field(&cmd.payload, "cluster_id")?;
        to_json(&self.registry().get_cluster_by_id(cluster_id)?)
    }
}

fn missing(field: &str) -> ClusterError {
    ClusterError::InvalidInput(format!("missing {}", field))
}

fn str_field<'a>(payload: &'a Value, field: &str) -> Result<&'a str, ClusterError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(field))
}

fn f64_field(payload: &Value, field: &str) -> Result<f64, ClusterError> {
    payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| missing(field))
}

fn typed_field<T: DeserializeOwned>(payload: &Value, field: &str) -> Result<T, ClusterError> {
    let value = payload.get(field).ok_or_else(|| missing(field))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ClusterError::InvalidInput(format!("{}: {}", field, e)))
}

fn to_json<T: Serialize>(value: &T) -> CommandResult {
    serde_json::to_value(value).map_err(|e| ClusterError::Store(StoreError::from(e)))
}
