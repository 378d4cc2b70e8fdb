//! Wire protocol: inbound frames accepted from a connection and outbound
//! envelopes the hub can emit.
//!
//! Every frame is a tagged JSON object (`{"type": "...", ...}`). Rather than
//! duck-typing on a generic `serde_json::Value` the way the distilled spec's
//! source did, inbound frames are an exhaustive `#[serde(tag = "type")]` enum:
//! an unrecognized `type` is a deserialization error, not a silently-ignored
//! payload, per the "duck-typed payloads -> tagged variants" redesign flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hub_session::{AgentId, SessionId, TaskId};

/// A frame read off a not-yet-authenticated connection. Only these two
/// variants are legal before a session exists (§4.F).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PreAuthFrame {
    Register {
        #[serde(rename = "agentName")]
        agent_name: Option<String>,
        role: Option<String>,
        #[serde(rename = "forceNew", default)]
        force_new: bool,
    },
    Auth {
        #[serde(rename = "agentName")]
        agent_name: Option<String>,
        #[serde(rename = "authToken")]
        auth_token: Option<String>,
        role: Option<String>,
        perspective: Option<String>,
        #[serde(rename = "clientVersion")]
        client_version: Option<String>,
    },
}

/// Task action payload carried by an inbound `task` frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Create,
    Claim,
    Complete,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskPayload {
    pub id: TaskId,
    #[serde(default, flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditFrame {
    pub file: String,
    pub edit: Value,
    pub version: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskFrame {
    pub action: TaskAction,
    pub task: TaskPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteFrame {
    #[serde(rename = "proposalId")]
    pub proposal_id: String,
    pub vote: String,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageFrame {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnFrame {
    pub mode: String,
    pub task: Option<TaskPayload>,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchRoleFrame {
    #[serde(rename = "newRole")]
    pub new_role: String,
}

/// A frame read off an authenticated connection (§4.E dispatch table).
///
/// Deriving this from a single `#[serde(tag = "type")]` enum would force an
/// unknown `type` to be a hard deserialization error, losing the original
/// payload the secondary registry (§4.E "anything else") needs to route on.
/// [`InboundFrame::parse`] instead dispatches on the `type` field by hand so
/// the eight named variants stay exhaustively typed while anything else is
/// preserved verbatim as [`InboundFrame::Other`].
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Edit(EditFrame),
    Task(TaskFrame),
    Vote(VoteFrame),
    Message(MessageFrame),
    Spawn(SpawnFrame),
    Whoami,
    SwitchRole(SwitchRoleFrame),
    GetHistory,
    /// `ping`, `echo`, `status`, and any other policy-extension type.
    Other { type_name: String, payload: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameParseError {
    #[error("missing required field `type`")]
    MissingType,
    #[error("malformed `{type_name}` frame: {source}")]
    Malformed {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundFrame {
    pub fn parse(value: Value) -> Result<Self, FrameParseError> {
        let type_name = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameParseError::MissingType)?
            .to_string();

        let malformed = |source: serde_json::Error| FrameParseError::Malformed {
            type_name: type_name.clone(),
            source,
        };

        Ok(match type_name.as_str() {
            "edit" => InboundFrame::Edit(serde_json::from_value(value).map_err(malformed)?),
            "task" => InboundFrame::Task(serde_json::from_value(value).map_err(malformed)?),
            "vote" => InboundFrame::Vote(serde_json::from_value(value).map_err(malformed)?),
            "message" => InboundFrame::Message(serde_json::from_value(value).map_err(malformed)?),
            "spawn" => InboundFrame::Spawn(serde_json::from_value(value).map_err(malformed)?),
            "whoami" => InboundFrame::Whoami,
            "switch-role" => {
                InboundFrame::SwitchRole(serde_json::from_value(value).map_err(malformed)?)
            }
            "get-history" => InboundFrame::GetHistory,
            _ => InboundFrame::Other {
                type_name,
                payload: value,
            },
        })
    }
}

/// The subset of inbound types subject to the anti-echo policy gate (§4.E).
pub fn is_checkable(frame: &InboundFrame) -> bool {
    matches!(
        frame,
        InboundFrame::Edit(_) | InboundFrame::Vote(_) | InboundFrame::Message(_)
    )
}

/// Server -> client envelopes. Serialized with `#[serde(tag = "type")]` so
/// every payload on the wire carries the same discriminant shape the inbound
/// side parses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundEnvelope {
    RegisterSuccess {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
        #[serde(rename = "agentName")]
        agent_name: String,
        #[serde(rename = "authToken")]
        auth_token: String,
        role: String,
    },
    RegisterFailed {
        reason: String,
        suggestions: Option<Vec<String>>,
    },
    AuthSuccess {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
        #[serde(rename = "authToken")]
        auth_token: String,
        #[serde(rename = "isReturning")]
        is_returning: bool,
        #[serde(rename = "totalSessions")]
        total_sessions: u64,
        #[serde(rename = "totalContributions")]
        total_contributions: u64,
        #[serde(rename = "lastSeen")]
        last_seen: DateTime<Utc>,
        #[serde(rename = "serverVersion")]
        server_version: String,
        #[serde(rename = "clientVersion")]
        client_version: Option<String>,
        #[serde(rename = "versionWarning")]
        version_warning: Option<String>,
        capabilities: Vec<String>,
    },
    AuthFailed {
        reason: String,
    },
    Error {
        message: String,
    },
    Chat {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "agentId")]
        agent_id: AgentId,
        #[serde(rename = "displayName")]
        display_name: String,
        role: String,
        perspective: Option<String>,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Edit {
        file: String,
        edit: Value,
        version: u64,
    },
    EditResolved {
        file: String,
        edit: Value,
        #[serde(rename = "resolvedBy")]
        resolved_by: String,
        confidence: f64,
    },
    TaskUpdate {
        event: String,
        task: Value,
    },
    TaskRejection {
        reason: String,
    },
    DecisionMade {
        #[serde(rename = "proposalId")]
        proposal_id: String,
        decision: String,
        confidence: f64,
        #[serde(rename = "diversityScore")]
        diversity_score: f64,
        perspectives: Vec<String>,
    },
    AgentsSpawned {
        agents: Vec<Value>,
    },
    DiversityIntervention {
        reason: String,
        #[serde(rename = "requiredAction")]
        required_action: String,
        suggestions: Vec<String>,
    },
    DiversityMetrics {
        #[serde(rename = "overallDiversity")]
        overall_diversity: f64,
        #[serde(rename = "agreementRate")]
        agreement_rate: f64,
        #[serde(rename = "evidenceRate")]
        evidence_rate: f64,
        #[serde(rename = "perspectiveDistribution")]
        perspective_distribution: std::collections::HashMap<String, u32>,
        #[serde(rename = "recentInterventions")]
        recent_interventions: u32,
    },
    SessionUpdate {
        event: String,
        session: Value,
    },
    SessionCleanup {
        #[serde(rename = "cleanedSessions")]
        cleaned_sessions: u32,
        timestamp: DateTime<Utc>,
    },
    RoleChanged {
        #[serde(rename = "oldRole")]
        old_role: String,
        #[serde(rename = "newRole")]
        new_role: String,
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },
    IdentityCard {
        card: Value,
    },
    HistoryReport {
        report: Value,
    },
    TaskBoardUpdate {
        data: Value,
    },
    DiscussionUpdate {
        data: Value,
    },
    NewMessageNotification {
        data: Value,
    },
    FileUpdate {
        data: Value,
    },
}

impl OutboundEnvelope {
    /// Serialize to the JSON text frame sent over the transport.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failure: {e}"}}"#)
        })
    }
}

/// The current protocol/server version advertised during `auth` (§6).
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
struct SemVer {
    major: u64,
    minor: u64,
    patch: u64,
}

impl SemVer {
    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        Some(Self { major, minor, patch })
    }
}

pub struct VersionCompatibility {
    /// `None` when client and server versions match exactly.
    pub warning: Option<String>,
    /// Set when the mismatch is severe enough to be an error-level
    /// incompatibility (major version differs) rather than an advisory.
    pub is_error: bool,
}

/// Parses `client_version`/`server_version` as `major.minor.patch` and
/// classifies the mismatch per §6 "Version compatibility":
/// missing -> warning; equal -> none; major differs -> error (names the
/// side that is behind); minor differs -> warning mentioning missing
/// features; patch differs -> warning.
pub fn check_version_compatibility(
    client_version: Option<&str>,
    server_version: &str,
) -> VersionCompatibility {
    let Some(client_raw) = client_version else {
        return VersionCompatibility {
            warning: Some(
                "client did not report a version; compatibility cannot be verified".to_string(),
            ),
            is_error: false,
        };
    };

    let Some(server) = SemVer::parse(server_version) else {
        return VersionCompatibility {
            warning: None,
            is_error: false,
        };
    };

    let Some(client) = SemVer::parse(client_raw) else {
        return VersionCompatibility {
            warning: Some(format!("client version {client_raw:?} could not be parsed")),
            is_error: false,
        };
    };

    if client == server {
        return VersionCompatibility {
            warning: None,
            is_error: false,
        };
    }

    if client.major != server.major {
        let behind = if client.major < server.major {
            "client"
        } else {
            "server"
        };
        return VersionCompatibility {
            warning: Some(format!(
                "major version mismatch (client {client_raw}, server {server_version}); \
                 the {behind} is behind and must be upgraded"
            )),
            is_error: true,
        };
    }

    if client.minor != server.minor {
        return VersionCompatibility {
            warning: Some(format!(
                "client {client_raw} is missing v{}.{} features available on server {server_version}",
                server.major, server.minor
            )),
            is_error: false,
        };
    }

    VersionCompatibility {
        warning: Some(format!(
            "patch version mismatch (client {client_raw}, server {server_version})"
        )),
        is_error: false,
    }
}
