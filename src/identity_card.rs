//! Identity-card and history-report builders for the `whoami` /
//! `get-history` responses (§6, §10.5).
//!
//! Rank, achievements, and coaching recommendations are computed
//! deterministically from stats already on the identity -- no external
//! diversity engine is consulted, matching the policy-free core (§1).

use chrono::Utc;
use serde_json::{json, Value};

use crate::identity::AgentIdentity;

struct Rank {
    title: &'static str,
    level: u32,
}

fn rank_for(score: f64) -> Rank {
    if score >= 100.0 {
        Rank { title: "Master Collaborator", level: 5 }
    } else if score >= 50.0 {
        Rank { title: "Senior Contributor", level: 4 }
    } else if score >= 25.0 {
        Rank { title: "Active Member", level: 3 }
    } else if score >= 10.0 {
        Rank { title: "Contributor", level: 2 }
    } else {
        Rank { title: "Newcomer", level: 1 }
    }
}

fn next_level_title(level: u32) -> Option<&'static str> {
    match level {
        1 => Some("Contributor"),
        2 => Some("Active Member"),
        3 => Some("Senior Contributor"),
        4 => Some("Master Collaborator"),
        _ => None,
    }
}

fn achievements_for(identity: &AgentIdentity, days_since_joined: i64) -> Vec<&'static str> {
    let mut tags = Vec::new();
    let stats = &identity.stats;

    if stats.total_messages >= 50 {
        tags.push("prolific-communicator");
    }
    if stats.total_edits >= 25 {
        tags.push("active-editor");
    }
    if stats.total_tasks >= 10 {
        tags.push("task-closer");
    }
    if stats.evidence_rate >= 0.8 {
        tags.push("evidence-driven");
    }
    if stats.diversity_score >= 0.8 {
        tags.push("diverse-thinker");
    }
    if days_since_joined >= 30 {
        tags.push("veteran");
    }

    tags
}

fn coaching_recommendations(identity: &AgentIdentity) -> Vec<&'static str> {
    let mut recommendations = Vec::new();
    let stats = &identity.stats;

    if stats.evidence_rate < 0.5 {
        recommendations.push("cite more evidence in votes");
    }
    if stats.agreement_rate > 0.9 {
        recommendations.push("seek out dissenting perspectives before voting");
    }
    if stats.diversity_score < 0.4 {
        recommendations.push("rotate perspectives more often to broaden coverage");
    }
    if stats.total_edits == 0 && stats.total_messages > 0 {
        recommendations.push("contribute an edit, not just discussion");
    }

    recommendations
}

/// Builds the `card` payload for an `identity-card` response.
pub fn build(identity: &AgentIdentity) -> Value {
    let days_since_joined = (Utc::now() - identity.first_seen).num_days();
    let score = identity.stats.total_messages as f64
        + identity.stats.total_tasks as f64
        + identity.stats.total_edits as f64
        + 10.0 * identity.stats.diversity_score
        + 5.0 * identity.stats.evidence_rate;

    let rank = rank_for(score);

    json!({
        "agentId": identity.agent_id,
        "displayName": identity.display_name,
        "currentRole": identity.current_role,
        "currentPerspective": identity.current_perspective,
        "firstSeen": identity.first_seen,
        "lastSeen": identity.last_seen,
        "daysSinceJoined": days_since_joined,
        "stats": identity.stats,
        "rank": {
            "title": rank.title,
            "level": rank.level,
            "nextLevel": next_level_title(rank.level),
        },
        "achievements": achievements_for(identity, days_since_joined),
        "coachingRecommendations": coaching_recommendations(identity),
    })
}

/// Builds the `report` payload for a `get-history` response: last 5 role
/// transitions, last 3 perspective transitions (§6).
pub fn build_history_report(identity: &AgentIdentity) -> Value {
    let roles: Vec<_> = identity
        .role_history
        .iter()
        .rev()
        .take(5)
        .cloned()
        .collect();
    let perspectives: Vec<_> = identity
        .perspective_history
        .iter()
        .rev()
        .take(3)
        .cloned()
        .collect();

    json!({
        "agentId": identity.agent_id,
        "roleHistory": roles,
        "perspectiveHistory": perspectives,
        "stats": identity.stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityStats, RoleTransition};
    use hub_session::AgentId;

    fn base_identity() -> AgentIdentity {
        let now = Utc::now();
        AgentIdentity {
            agent_id: AgentId::new(),
            display_name: "alice".into(),
            auth_token: "tok".into(),
            first_seen: now - chrono::Duration::days(40),
            last_seen: now,
            current_role: "researcher".into(),
            role_history: vec![RoleTransition {
                role: "observer".into(),
                timestamp: now,
                session_id: None,
            }],
            current_perspective: Some("skeptic".into()),
            perspective_history: Vec::new(),
            stats: IdentityStats::default(),
            current_session_id: None,
            last_activity_time: None,
        }
    }

    #[test]
    fn newcomer_rank_for_low_score() {
        let identity = base_identity();
        let card = build(&identity);
        assert_eq!(card["rank"]["title"], "Newcomer");
        assert_eq!(card["rank"]["level"], 1);
    }

    #[test]
    fn high_score_reaches_master_collaborator() {
        let mut identity = base_identity();
        identity.stats.total_messages = 120;
        identity.stats.diversity_score = 1.0;
        identity.stats.evidence_rate = 1.0;
        let card = build(&identity);
        assert_eq!(card["rank"]["title"], "Master Collaborator");
        assert!(card["rank"]["nextLevel"].is_null());
    }

    #[test]
    fn veteran_achievement_requires_thirty_days() {
        let identity = base_identity();
        let card = build(&identity);
        let achievements: Vec<String> = card["achievements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(achievements.contains(&"veteran".to_string()));
    }

    #[test]
    fn low_evidence_rate_recommends_citing_evidence() {
        let mut identity = base_identity();
        identity.stats.evidence_rate = 0.1;
        let card = build(&identity);
        let recs: Vec<String> = card["coachingRecommendations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(recs.iter().any(|r| r.contains("cite more evidence")));
    }

    #[test]
    fn history_report_caps_role_and_perspective_counts() {
        let mut identity = base_identity();
        identity.role_history = (0..10)
            .map(|i| RoleTransition {
                role: format!("role-{i}"),
                timestamp: Utc::now(),
                session_id: None,
            })
            .collect();
        let report = build_history_report(&identity);
        assert_eq!(report["roleHistory"].as_array().unwrap().len(), 5);
    }
}
