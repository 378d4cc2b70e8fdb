//! External collaborator contracts (§10.6).
//!
//! The "diversity/anti-echo" engine and the task orchestrator are explicitly
//! out of scope (§1) -- the core only commits to the hook points a real
//! policy plugs into. Each trait gets a minimal default implementation so
//! the server runs standalone; unit tests substitute `mockall`-generated
//! fakes, honoring the "no global observer registry" redesign flag (§9) by
//! injecting collaborators rather than reaching for ambient globals.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use hub_session::AgentId;

/// Outcome of proposing an edit to the external coordinator.
#[derive(Debug, Clone)]
pub enum EditOutcome {
    Applied,
    Conflict { other: Value },
}

/// Resolved edit returned by a conflict resolver.
#[derive(Debug, Clone)]
pub struct ResolvedEdit {
    pub edit: Value,
    pub resolved_by: String,
    pub confidence: f64,
}

#[async_trait]
pub trait EditCoordinator: Send + Sync {
    async fn propose_edit(&self, file: &str, edit: &Value, version: u64) -> EditOutcome;
}

#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, file: &str, mine: &Value, other: &Value) -> ResolvedEdit;
}

/// Verdict returned by the anti-echo policy's `check`.
#[derive(Debug, Clone)]
pub enum PolicyVerdict {
    Allowed,
    Denied {
        reason: String,
        required_action: String,
        suggestions: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiversityMetrics {
    pub overall_diversity: f64,
    pub agreement_rate: f64,
    pub evidence_rate: f64,
    pub perspective_distribution: HashMap<String, u32>,
    pub recent_interventions: u32,
}

#[async_trait]
pub trait AntiEchoPolicy: Send + Sync {
    /// Whether this policy is active at all. When `false` the hub skips the
    /// checkable-message gate and perspective assignment entirely (§4.E/4.F).
    fn enabled(&self) -> bool;

    /// Evaluate a checkable message (`edit`, `vote`, `message`, ...).
    async fn check(&self, kind: &str, agent_id: &AgentId, payload: &Value) -> PolicyVerdict;

    /// Assign a perspective to a newly authenticated agent that didn't
    /// supply one, given the perspectives currently active among sessions.
    async fn assign_perspective(&self, active: &[String]) -> Option<String>;

    /// Weight a vote by perspective and supporting evidence.
    async fn vote_weight(&self, perspective: Option<&str>, evidence: Option<&str>) -> f64;

    /// Whether `agent_id` (given its current perspective) may claim `task`
    /// (§4.E: "task `claim` first consults the external policy `canClaim`").
    async fn can_claim(&self, agent_id: &AgentId, perspective: Option<&str>, task: &Value) -> bool;

    async fn metrics_snapshot(&self) -> DiversityMetrics;
}

/// A spawned agent descriptor, as returned by the external orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub role: String,
    pub perspective: Option<String>,
}

#[async_trait]
pub trait TaskOrchestrator: Send + Sync {
    async fn enrich_task(&self, task: Value) -> Value;
    async fn register_task(&self, task: &Value);
    /// Records one weighted vote; returns the final decision once the
    /// orchestrator considers the proposal settled (§4.E "on completion,
    /// broadcasts the final decision").
    async fn record_vote(
        &self,
        proposal_id: &str,
        agent_id: &AgentId,
        vote: &str,
        weight: f64,
    ) -> Option<VoteDecision>;
    async fn spawn_agents(&self, mode: &str, task: Option<Value>, count: u32) -> Vec<AgentDescriptor>;
}

/// No-op defaults wired in by H so the server is fully functional with the
/// policy engine absent (§10.6: "anti-echo disabled, orchestrator accepts
/// everything").
pub struct NoopEditCoordinator;

#[async_trait]
impl EditCoordinator for NoopEditCoordinator {
    async fn propose_edit(&self, _file: &str, _edit: &Value, _version: u64) -> EditOutcome {
        EditOutcome::Applied
    }
}

pub struct NoopConflictResolver;

#[async_trait]
impl ConflictResolver for NoopConflictResolver {
    async fn resolve(&self, _file: &str, mine: &Value, _other: &Value) -> ResolvedEdit {
        ResolvedEdit {
            edit: mine.clone(),
            resolved_by: "last-writer".into(),
            confidence: 0.5,
        }
    }
}

pub struct DisabledAntiEchoPolicy;

#[async_trait]
impl AntiEchoPolicy for DisabledAntiEchoPolicy {
    fn enabled(&self) -> bool {
        false
    }

    async fn check(&self, _kind: &str, _agent_id: &AgentId, _payload: &Value) -> PolicyVerdict {
        PolicyVerdict::Allowed
    }

    async fn assign_perspective(&self, _active: &[String]) -> Option<String> {
        None
    }

    async fn vote_weight(&self, _perspective: Option<&str>, _evidence: Option<&str>) -> f64 {
        1.0
    }

    async fn can_claim(&self, _agent_id: &AgentId, _perspective: Option<&str>, _task: &Value) -> bool {
        true
    }

    async fn metrics_snapshot(&self) -> DiversityMetrics {
        DiversityMetrics::default()
    }
}

/// The outcome of a vote tally, broadcast as `decision-made` once the
/// (external, out-of-scope) orchestrator considers a proposal settled.
#[derive(Debug, Clone)]
pub struct VoteDecision {
    pub decision: String,
    pub confidence: f64,
    pub diversity_score: f64,
    pub perspectives: Vec<String>,
}

pub struct PassthroughOrchestrator;

#[async_trait]
impl TaskOrchestrator for PassthroughOrchestrator {
    async fn enrich_task(&self, task: Value) -> Value {
        task
    }

    async fn register_task(&self, _task: &Value) {}

    /// Never resolves a proposal on its own -- deciding when enough votes
    /// have accumulated is policy, not core (§1/§9).
    async fn record_vote(
        &self,
        _proposal_id: &str,
        _agent_id: &AgentId,
        _vote: &str,
        _weight: f64,
    ) -> Option<VoteDecision> {
        None
    }

    async fn spawn_agents(&self, _mode: &str, _task: Option<Value>, count: u32) -> Vec<AgentDescriptor> {
        Vec::with_capacity(count as usize)
    }
}
