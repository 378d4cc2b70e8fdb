//! Component E: the message hub.
//!
//! One read loop per authenticated connection feeds frames into
//! [`MessageHub::handle_frame`], which gates checkable messages through the
//! anti-echo policy, dispatches the eight named types, and routes anything
//! else to a small secondary registry (§4.E).

use std::collections::HashMap;

use axum::extract::ws::Message;
use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use hub_session::SessionId;

use crate::locks::ClaimStatus;
use crate::policy::{EditOutcome, PolicyVerdict};
use crate::protocol::{
    is_checkable, EditFrame, InboundFrame, MessageFrame, OutboundEnvelope, SpawnFrame,
    SwitchRoleFrame, TaskAction, TaskFrame, VoteFrame,
};
use crate::session::{Counter, Session};
use crate::state::SharedState;

/// What the secondary registry does with an unrecognized `type` (§4.E
/// "anything else"): the default, empty registry silently ignores
/// everything, matching "unknowns are ignored silently... per registered
/// policy" when no policy has registered an opinion.
#[derive(Clone)]
pub enum SecondaryAction {
    Ignore,
    RespondError(String),
}

#[derive(Default)]
pub struct SecondaryRegistry {
    exact: HashMap<String, SecondaryAction>,
    patterns: Vec<(Regex, SecondaryAction)>,
}

impl SecondaryRegistry {
    pub fn register_exact(&mut self, type_name: impl Into<String>, action: SecondaryAction) {
        self.exact.insert(type_name.into(), action);
    }

    pub fn register_pattern(&mut self, pattern: Regex, action: SecondaryAction) {
        self.patterns.push((pattern, action));
    }

    fn resolve(&self, type_name: &str) -> SecondaryAction {
        if let Some(action) = self.exact.get(type_name) {
            return action.clone();
        }
        for (pattern, action) in &self.patterns {
            if pattern.is_match(type_name) {
                return action.clone();
            }
        }
        SecondaryAction::Ignore
    }
}

pub struct MessageHub {
    state: SharedState,
    secondary: SecondaryRegistry,
}

impl MessageHub {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            secondary: SecondaryRegistry::default(),
        }
    }

    pub fn with_secondary_registry(state: SharedState, secondary: SecondaryRegistry) -> Self {
        Self { state, secondary }
    }

    pub async fn send_to(&self, session: &Session, envelope: &OutboundEnvelope) {
        let _ = session.connection.send(Message::Text(envelope.to_json()));
    }

    /// Best-effort: a write to a closed or slow connection does not block or
    /// reorder delivery to others (§4.E).
    pub async fn broadcast(&self, envelope: &OutboundEnvelope, exclude: Option<&SessionId>) {
        for session in self.state.sessions.all().await {
            if Some(&session.session_id) == exclude {
                continue;
            }
            if session.connection.send(Message::Text(envelope.to_json())).is_err() {
                debug!(session = %session.session_id, "broadcast target connection closed, skipping");
            }
        }
    }

    /// Entry point for a connection's read loop: one inbound text frame.
    pub async fn handle_frame(&self, session_id: &SessionId, raw: &str) {
        let Some(session) = self.state.sessions.get(session_id).await else {
            warn!(%session_id, "frame received for unknown session");
            return;
        };

        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.send_to(
                    &session,
                    &OutboundEnvelope::Error {
                        message: format!("malformed JSON frame: {e}"),
                    },
                )
                .await;
                return;
            }
        };

        let frame = match InboundFrame::parse(value.clone()) {
            Ok(f) => f,
            Err(e) => {
                self.send_to(&session, &OutboundEnvelope::Error { message: e.to_string() })
                    .await;
                return;
            }
        };

        if is_checkable(&frame) && self.state.anti_echo.enabled() {
            let kind = checkable_kind(&frame);
            let verdict = self.state.anti_echo.check(kind, &session.agent_id, &value).await;
            if let PolicyVerdict::Denied {
                reason,
                required_action,
                suggestions,
            } = verdict
            {
                self.send_to(
                    &session,
                    &OutboundEnvelope::DiversityIntervention {
                        reason,
                        required_action,
                        suggestions,
                    },
                )
                .await;
                return;
            }
        }

        match frame {
            InboundFrame::Edit(edit) => self.handle_edit(&session, edit).await,
            InboundFrame::Task(task) => self.handle_task(&session, task).await,
            InboundFrame::Vote(vote) => self.handle_vote(&session, vote).await,
            InboundFrame::Message(message) => self.handle_message(&session, message).await,
            InboundFrame::Spawn(spawn) => self.handle_spawn(&session, spawn).await,
            InboundFrame::Whoami => self.handle_whoami(&session).await,
            InboundFrame::SwitchRole(switch) => self.handle_switch_role(&session, switch).await,
            InboundFrame::GetHistory => self.handle_get_history(&session).await,
            InboundFrame::Other { type_name, payload } => {
                self.handle_secondary(&session, &type_name, payload).await
            }
        }

        self.state.identity.touch_activity(&session.agent_id).await;
    }

    async fn handle_secondary(&self, session: &Session, type_name: &str, _payload: Value) {
        match self.secondary.resolve(type_name) {
            SecondaryAction::Ignore => {
                debug!(%type_name, "ignoring unrecognized message type");
            }
            SecondaryAction::RespondError(message) => {
                self.send_to(session, &OutboundEnvelope::Error { message }).await;
            }
        }
    }

    async fn handle_edit(&self, session: &Session, edit: EditFrame) {
        let outcome = self
            .state
            .edit_coordinator
            .propose_edit(&edit.file, &edit.edit, edit.version)
            .await;

        match outcome {
            EditOutcome::Applied => {
                self.broadcast(
                    &OutboundEnvelope::Edit {
                        file: edit.file,
                        edit: edit.edit,
                        version: edit.version,
                    },
                    Some(&session.session_id),
                )
                .await;
            }
            EditOutcome::Conflict { other } => {
                let resolved = self
                    .state
                    .conflict_resolver
                    .resolve(&edit.file, &edit.edit, &other)
                    .await;
                self.broadcast(
                    &OutboundEnvelope::EditResolved {
                        file: edit.file,
                        edit: resolved.edit,
                        resolved_by: resolved.resolved_by,
                        confidence: resolved.confidence,
                    },
                    Some(&session.session_id),
                )
                .await;
            }
        }

        self.state.sessions.bump(&session.session_id, Counter::Edits).await;
    }

    async fn handle_task(&self, session: &Session, frame: TaskFrame) {
        let task_id = frame.task.id.clone();
        let task_value = json!({"id": task_id.to_string()});
        let task_value = merge_extra(task_value, &frame.task.extra);

        match frame.action {
            TaskAction::Create => {
                let enriched = self.state.orchestrator.enrich_task(task_value).await;
                self.state.orchestrator.register_task(&enriched).await;
                self.state.sessions.bump(&session.session_id, Counter::Tasks).await;
                self.broadcast(
                    &OutboundEnvelope::TaskUpdate {
                        event: "created".into(),
                        task: enriched,
                    },
                    None,
                )
                .await;
            }
            TaskAction::Claim => {
                let perspective = session.current_perspective.as_deref();
                let allowed = !self.state.anti_echo.enabled()
                    || self
                        .state
                        .anti_echo
                        .can_claim(&session.agent_id, perspective, &task_value)
                        .await;

                if !allowed {
                    self.send_to(
                        session,
                        &OutboundEnvelope::TaskRejection {
                            reason: "perspective mismatch for this task".into(),
                        },
                    )
                    .await;
                    return;
                }

                let Some(token) = self.state.locks.acquire_lock(&task_id, &session.agent_id).await
                else {
                    self.send_to(
                        session,
                        &OutboundEnvelope::TaskRejection {
                            reason: "task is locked by another agent".into(),
                        },
                    )
                    .await;
                    return;
                };

                if !self
                    .state
                    .locks
                    .claim_task(&task_id, &session.agent_id, &token)
                    .await
                {
                    self.send_to(
                        session,
                        &OutboundEnvelope::TaskRejection {
                            reason: "task is already claimed".into(),
                        },
                    )
                    .await;
                    return;
                }

                self.broadcast(
                    &OutboundEnvelope::TaskUpdate {
                        event: "assigned".into(),
                        task: task_value,
                    },
                    None,
                )
                .await;
            }
            TaskAction::Complete => {
                self.state
                    .locks
                    .update_status(&task_id, &session.agent_id, ClaimStatus::Completed)
                    .await;
                self.state.sessions.bump(&session.session_id, Counter::Tasks).await;
                self.broadcast(
                    &OutboundEnvelope::TaskUpdate {
                        event: "completed".into(),
                        task: task_value,
                    },
                    None,
                )
                .await;
            }
        }
    }

    async fn handle_vote(&self, session: &Session, vote: VoteFrame) {
        let weight = self
            .state
            .anti_echo
            .vote_weight(session.current_perspective.as_deref(), vote.evidence.as_deref())
            .await;

        let decision = self
            .state
            .orchestrator
            .record_vote(&vote.proposal_id, &session.agent_id, &vote.vote, weight)
            .await;

        if let Some(decision) = decision {
            self.broadcast(
                &OutboundEnvelope::DecisionMade {
                    proposal_id: vote.proposal_id,
                    decision: decision.decision,
                    confidence: decision.confidence,
                    diversity_score: decision.diversity_score,
                    perspectives: decision.perspectives,
                },
                None,
            )
            .await;
        }
    }

    async fn handle_message(&self, session: &Session, message: MessageFrame) {
        let identity = self
            .state
            .identity
            .find_by_agent_id(&session.agent_id)
            .await;
        let display_name = identity
            .as_ref()
            .map(|id| id.display_name.clone())
            .unwrap_or_default();

        self.state
            .discussion
            .append(
                &display_name,
                &session.agent_id,
                &session.current_role,
                session.current_perspective.as_deref(),
                &message.text,
            )
            .await;

        self.broadcast(
            &OutboundEnvelope::Chat {
                session_id: session.session_id.clone(),
                agent_id: session.agent_id.clone(),
                display_name,
                role: session.current_role.clone(),
                perspective: session.current_perspective.clone(),
                text: message.text,
                timestamp: Utc::now(),
            },
            Some(&session.session_id),
        )
        .await;

        self.state.sessions.bump(&session.session_id, Counter::Messages).await;
    }

    async fn handle_spawn(&self, session: &Session, spawn: SpawnFrame) {
        let task_value = spawn.task.map(|t| {
            let base = json!({"id": t.id.to_string()});
            merge_extra(base, &t.extra)
        });

        let mut agents = self
            .state
            .orchestrator
            .spawn_agents(&spawn.mode, task_value, spawn.count)
            .await;

        if self.state.anti_echo.enabled() {
            let active = self.state.sessions.active_perspectives().await;
            for agent in &mut agents {
                if agent.perspective.is_none() {
                    agent.perspective = self.state.anti_echo.assign_perspective(&active).await;
                }
            }
        }

        let agents_json: Vec<Value> = agents
            .iter()
            .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
            .collect();

        self.send_to(session, &OutboundEnvelope::AgentsSpawned { agents: agents_json })
            .await;
    }

    async fn handle_whoami(&self, session: &Session) {
        let Some(identity) = self.state.identity.find_by_agent_id(&session.agent_id).await else {
            self.send_to(
                session,
                &OutboundEnvelope::Error {
                    message: "identity no longer exists".into(),
                },
            )
            .await;
            return;
        };

        let card = crate::identity_card::build(&identity);
        self.send_to(session, &OutboundEnvelope::IdentityCard { card }).await;
    }

    async fn handle_switch_role(&self, session: &Session, switch: SwitchRoleFrame) {
        let old_role = session.current_role.clone();
        self.state
            .sessions
            .change_role(&session.session_id, &switch.new_role)
            .await;

        self.send_to(
            session,
            &OutboundEnvelope::RoleChanged {
                old_role,
                new_role: switch.new_role.clone(),
                agent_id: session.agent_id.clone(),
            },
        )
        .await;

        self.broadcast(
            &OutboundEnvelope::SessionUpdate {
                event: "role-changed".into(),
                session: json!({
                    "sessionId": session.session_id.to_string(),
                    "agentId": session.agent_id.to_string(),
                    "newRole": switch.new_role,
                }),
            },
            Some(&session.session_id),
        )
        .await;
    }

    async fn handle_get_history(&self, session: &Session) {
        let Some(identity) = self.state.identity.find_by_agent_id(&session.agent_id).await else {
            self.send_to(
                session,
                &OutboundEnvelope::Error {
                    message: "identity no longer exists".into(),
                },
            )
            .await;
            return;
        };

        let report = crate::identity_card::build_history_report(&identity);
        self.send_to(session, &OutboundEnvelope::HistoryReport { report }).await;
    }
}

fn checkable_kind(frame: &InboundFrame) -> &'static str {
    match frame {
        InboundFrame::Edit(_) => "edit",
        InboundFrame::Vote(_) => "vote",
        InboundFrame::Message(_) => "message",
        _ => "",
    }
}

fn merge_extra(mut base: Value, extra: &Value) -> Value {
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secondary_registry_defaults_to_ignore() {
        let registry = SecondaryRegistry::default();
        assert!(matches!(registry.resolve("ping"), SecondaryAction::Ignore));
    }

    #[test]
    fn secondary_registry_exact_match_overrides_default() {
        let mut registry = SecondaryRegistry::default();
        registry.register_exact("status", SecondaryAction::RespondError("nope".into()));
        assert!(matches!(
            registry.resolve("status"),
            SecondaryAction::RespondError(_)
        ));
        assert!(matches!(registry.resolve("ping"), SecondaryAction::Ignore));
    }

    #[test]
    fn secondary_registry_pattern_match() {
        let mut registry = SecondaryRegistry::default();
        registry.register_pattern(
            Regex::new(r"^debug-.*$").unwrap(),
            SecondaryAction::RespondError("debug types unsupported".into()),
        );
        assert!(matches!(
            registry.resolve("debug-dump"),
            SecondaryAction::RespondError(_)
        ));
    }

    #[test]
    fn merge_extra_keeps_base_fields_on_conflict() {
        let base = json!({"id": "T-1"});
        let extra = json!({"id": "ignored", "title": "demo"});
        let merged = merge_extra(base, &extra);
        assert_eq!(merged["id"], "T-1");
        assert_eq!(merged["title"], "demo");
    }
}
