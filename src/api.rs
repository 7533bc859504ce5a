// 📡 Typed call surface
//
// One Request variant per call, one Response variant per reply shape.
// Requests are JSON objects tagged by `call`:
//
//   {"call": "accept_commission", "context": {"entity": "e1", "key": "k1"}, "serial": 4}

use crate::batch::{BatchResult, IssueOutcome, Lookup};
use crate::commission::{Provision, Resolution};
use crate::entity::{Context, EntityInfo, KeyRotation, ListQuery, NewEntity};
use crate::error::{QuotaError, QuotaResult};
use crate::holder::QuotaHolder;
use crate::holding::{Holding, HoldingKey, HoldingUpdate, QuotaSnapshot, QuotaUpdate};
use crate::policy::{Policy, PolicyLimits};
use crate::timeline::{TimelineEntry, TimelineQuery};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Request {
    CreateEntity {
        context: Context,
        entities: Vec<NewEntity>,
    },
    SetEntityKey {
        rotations: Vec<KeyRotation>,
    },
    ListEntities {
        entity: String,
        key: String,
        #[serde(default)]
        query: ListQuery,
    },
    GetEntity {
        entity: String,
        key: String,
    },
    ReleaseEntity {
        context: Context,
        entity: String,
    },
    SetLimits {
        context: Context,
        policies: Vec<PolicyLimits>,
    },
    GetLimits {
        context: Context,
        policies: Vec<String>,
    },
    GetHolding {
        context: Context,
        holdings: Vec<HoldingKey>,
    },
    SetHolding {
        context: Context,
        holdings: Vec<HoldingUpdate>,
    },
    GetQuota {
        context: Context,
        holdings: Vec<HoldingKey>,
    },
    SetQuota {
        context: Context,
        quotas: Vec<QuotaUpdate>,
    },
    ListResources {
        entity: String,
        key: String,
    },
    IssueCommission {
        context: Context,
        provisions: Vec<Provision>,
    },
    AcceptCommission {
        context: Context,
        serial: u64,
    },
    RejectCommission {
        context: Context,
        serial: u64,
    },
    GetPendingCommissions {
        context: Context,
    },
    ResolvePendingCommissions {
        context: Context,
        resolutions: Vec<Resolution>,
    },
    GetTimeline {
        context: Context,
        query: TimelineQuery,
    },
    /// Without `resolved_before` the configured retention applies
    PurgeCommissions {
        context: Context,
        #[serde(default)]
        resolved_before: Option<DateTime<Utc>>,
    },
}

impl Request {
    /// Parse a JSON request; malformed input is a validation error
    pub fn from_json(json: &str) -> QuotaResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| QuotaError::Validation(format!("malformed request: {}", e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::CreateEntity { .. } => "create_entity",
            Request::SetEntityKey { .. } => "set_entity_key",
            Request::ListEntities { .. } => "list_entities",
            Request::GetEntity { .. } => "get_entity",
            Request::ReleaseEntity { .. } => "release_entity",
            Request::SetLimits { .. } => "set_limits",
            Request::GetLimits { .. } => "get_limits",
            Request::GetHolding { .. } => "get_holding",
            Request::SetHolding { .. } => "set_holding",
            Request::GetQuota { .. } => "get_quota",
            Request::SetQuota { .. } => "set_quota",
            Request::ListResources { .. } => "list_resources",
            Request::IssueCommission { .. } => "issue_commission",
            Request::AcceptCommission { .. } => "accept_commission",
            Request::RejectCommission { .. } => "reject_commission",
            Request::GetPendingCommissions { .. } => "get_pending_commissions",
            Request::ResolvePendingCommissions { .. } => "resolve_pending_commissions",
            Request::GetTimeline { .. } => "get_timeline",
            Request::PurgeCommissions { .. } => "purge_commissions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "data", rename_all = "snake_case")]
pub enum Response {
    Done,
    Entity(EntityInfo),
    Names(Vec<String>),
    Serials(Vec<u64>),
    Purged(usize),
    /// Rejected entity or policy names
    NameBatch(BatchResult<String>),
    HoldingBatch(BatchResult<HoldingKey>),
    SerialBatch(BatchResult<u64>),
    Policies(Lookup<Policy, String>),
    Holdings(Lookup<Holding, HoldingKey>),
    Quotas(Lookup<QuotaSnapshot, HoldingKey>),
    Issued(IssueOutcome),
    Timeline(Vec<TimelineEntry>),
}

/// Run one request against `holder`
pub fn dispatch(holder: &QuotaHolder, request: Request) -> QuotaResult<Response> {
    debug!(call = request.name(), "Dispatching call");

    let response = match request {
        Request::CreateEntity { context, entities } => {
            Response::NameBatch(holder.create_entity(&context, entities)?)
        }
        Request::SetEntityKey { rotations } => Response::NameBatch(holder.set_entity_key(rotations)?),
        Request::ListEntities { entity, key, query } => {
            Response::Names(holder.list_entities(&entity, &key, &query)?)
        }
        Request::GetEntity { entity, key } => Response::Entity(holder.get_entity(&entity, &key)?),
        Request::ReleaseEntity { context, entity } => {
            holder.release_entity(&context, &entity)?;
            Response::Done
        }
        Request::SetLimits { context, policies } => {
            Response::NameBatch(holder.set_limits(&context, policies)?)
        }
        Request::GetLimits { context, policies } => {
            Response::Policies(holder.get_limits(&context, policies)?)
        }
        Request::GetHolding { context, holdings } => {
            Response::Holdings(holder.get_holding(&context, holdings)?)
        }
        Request::SetHolding { context, holdings } => {
            Response::HoldingBatch(holder.set_holding(&context, holdings)?)
        }
        Request::GetQuota { context, holdings } => {
            Response::Quotas(holder.get_quota(&context, holdings)?)
        }
        Request::SetQuota { context, quotas } => {
            Response::HoldingBatch(holder.set_quota(&context, quotas)?)
        }
        Request::ListResources { entity, key } => {
            Response::Names(holder.list_resources(&entity, &key)?)
        }
        Request::IssueCommission { context, provisions } => {
            Response::Issued(holder.issue_commission(&context, provisions)?)
        }
        Request::AcceptCommission { context, serial } => {
            holder.accept_commission(&context, serial)?;
            Response::Done
        }
        Request::RejectCommission { context, serial } => {
            holder.reject_commission(&context, serial)?;
            Response::Done
        }
        Request::GetPendingCommissions { context } => {
            Response::Serials(holder.get_pending_commissions(&context)?)
        }
        Request::ResolvePendingCommissions { context, resolutions } => {
            Response::SerialBatch(holder.resolve_pending_commissions(&context, resolutions)?)
        }
        Request::GetTimeline { context, query } => {
            Response::Timeline(holder.get_timeline(&context, &query)?)
        }
        Request::PurgeCommissions {
            context,
            resolved_before,
        } => {
            let purged = match resolved_before {
                Some(cutoff) => holder.purge_commissions(&context, cutoff)?,
                None => holder.purge_expired(&context)?,
            };
            Response::Purged(purged)
        }
    };

    Ok(response)
}
