//! Agent selection — the four routing strategies.
//!
//! `supervisor` scores routing keywords, `orchestrator` walks a fixed
//! pipeline, `few_shot` asks an LLM primed with example decisions, and
//! `hybrid` mixes the two per phase. Every strategy runs its choice (and
//! each fallback) through the same eligibility filter: only PRODUCTION
//! agents are routable, TESTING only with an explicit override.

use std::sync::Arc;

use futures_util::StreamExt;

use parley_domain::cancel::CancelToken;
use parley_domain::config::{AgentDef, DomainDef, HybridPhase, Role, WorkflowType};
use parley_domain::message::ChatMessage;
use parley_domain::records::{MessageRole, StoredMessage};
use parley_domain::registry::Snapshot;
use parley_domain::stream::LlmEvent;
use parley_providers::{ClientPool, StreamRequest};

use crate::metrics::record_router_decision;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RouteInput<'a> {
    pub domain: &'a DomainDef,
    pub snapshot: &'a Snapshot,
    pub user_message: &'a str,
    pub history: &'a [StoredMessage],
    pub requester_role: Role,
    pub testing_override: bool,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub agent_id: String,
    pub confidence: f64,
    pub rationale: String,
    pub strategy: &'static str,
}

#[derive(Debug, thiserror::Error)]
#[error("no eligible agent in domain {domain_id}")]
pub struct NoEligibleAgent {
    pub domain_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn route(
    input: &RouteInput<'_>,
    pool: &ClientPool,
) -> Result<RouteDecision, NoEligibleAgent> {
    let result = match input.domain.workflow_type {
        WorkflowType::Supervisor => supervisor(input),
        WorkflowType::Orchestrator => orchestrator(input),
        WorkflowType::FewShot => few_shot(input, pool).await,
        WorkflowType::Hybrid => hybrid(input, pool).await,
    };

    match &result {
        Ok(decision) => record_router_decision(decision.strategy, "ok"),
        Err(_) => record_router_decision(input.domain.workflow_type.as_str(), "no_eligible_agent"),
    }
    result
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Eligibility
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whether a turn may be routed to an agent right now.
pub fn is_eligible(input: &RouteInput<'_>, agent: &AgentDef) -> bool {
    agent.state.is_routable(input.testing_override)
}

fn lookup<'a>(input: &RouteInput<'a>, agent_id: &str) -> Option<Arc<AgentDef>> {
    input.snapshot.get_agent(agent_id)
}

/// Walk `candidates` in order, then the domain fallback, returning the
/// first eligible agent.
fn first_eligible(
    input: &RouteInput<'_>,
    candidates: impl IntoIterator<Item = String>,
) -> Option<Arc<AgentDef>> {
    for agent_id in candidates {
        if let Some(agent) = lookup(input, &agent_id) {
            if is_eligible(input, &agent) {
                return Some(agent);
            }
        }
    }
    input
        .domain
        .fallback_agent_id
        .as_ref()
        .and_then(|id| lookup(input, id))
        .filter(|agent| is_eligible(input, agent))
}

fn no_eligible(input: &RouteInput<'_>) -> NoEligibleAgent {
    NoEligibleAgent {
        domain_id: input.domain.id.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// supervisor — keyword scoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Continuity bonus for the agent that produced the last assistant
/// message.
const CONTINUITY_BONUS: f64 = 0.1;

fn last_assistant_agent(history: &[StoredMessage]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
        .and_then(|m| m.agent_id.as_deref())
}

/// Case-insensitive whole-word keyword match, so "rust" does not fire on
/// "frustrated".
fn keyword_matches(message: &str, keyword: &str) -> bool {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword.trim()));
    match regex::Regex::new(&pattern) {
        Ok(re) => re.is_match(message),
        Err(_) => message.to_lowercase().contains(&keyword.to_lowercase()),
    }
}

fn keyword_score(input: &RouteInput<'_>, agent: &AgentDef) -> f64 {
    let mut score = 0.0;

    for rule in &input.domain.routing_rules {
        if rule.agent_id == agent.id && keyword_matches(input.user_message, &rule.keyword) {
            score += rule.priority;
        }
    }
    for keyword in &agent.routing_keywords {
        if keyword_matches(input.user_message, keyword) {
            score += 1.0;
        }
    }
    if last_assistant_agent(input.history) == Some(agent.id.as_str()) {
        score += CONTINUITY_BONUS;
    }
    score
}

fn supervisor(input: &RouteInput<'_>) -> Result<RouteDecision, NoEligibleAgent> {
    let agents = input.snapshot.list_agents_for_domain(&input.domain.id);

    let mut scored: Vec<(Arc<AgentDef>, f64)> = agents
        .iter()
        .map(|agent| (agent.clone(), keyword_score(input, agent)))
        .collect();
    // Highest score first; ties broken in favor of the default agent,
    // then domain declaration order (the sort is stable).
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_default = a.0.id == input.domain.default_agent_id;
                let b_default = b.0.id == input.domain.default_agent_id;
                b_default.cmp(&a_default)
            })
    });

    let best_score = scored.first().map(|(_, s)| *s).unwrap_or(0.0);

    if best_score < input.domain.min_confidence_threshold {
        let candidates = input
            .domain
            .fallback_agent_id
            .clone()
            .into_iter()
            .chain(std::iter::once(input.domain.default_agent_id.clone()));
        let agent = first_eligible(input, candidates).ok_or_else(|| no_eligible(input))?;
        return Ok(RouteDecision {
            agent_id: agent.id.clone(),
            confidence: best_score,
            rationale: format!(
                "no keyword matched above threshold {}; using {}",
                input.domain.min_confidence_threshold, agent.id
            ),
            strategy: "supervisor",
        });
    }

    let ranked = scored.iter().map(|(agent, _)| agent.id.clone());
    let agent = first_eligible(input, ranked).ok_or_else(|| no_eligible(input))?;
    let confidence = scored
        .iter()
        .find(|(a, _)| a.id == agent.id)
        .map(|(_, s)| (*s).min(1.0))
        .unwrap_or(best_score.min(1.0));

    Ok(RouteDecision {
        agent_id: agent.id.clone(),
        confidence,
        rationale: format!("keyword score {confidence:.2}"),
        strategy: "supervisor",
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// orchestrator — fixed pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The pipeline position is derived from persisted history (assistant
/// message count), so it survives restarts and resets on new
/// conversations.
fn pipeline_index(input: &RouteInput<'_>) -> usize {
    input
        .history
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .count()
}

fn orchestrator(input: &RouteInput<'_>) -> Result<RouteDecision, NoEligibleAgent> {
    let pipeline = &input.domain.orchestration_pipeline;
    if pipeline.is_empty() {
        let agent = first_eligible(
            input,
            std::iter::once(input.domain.default_agent_id.clone()),
        )
        .ok_or_else(|| no_eligible(input))?;
        return Ok(RouteDecision {
            agent_id: agent.id.clone(),
            confidence: 1.0,
            rationale: "empty pipeline; default agent".into(),
            strategy: "orchestrator",
        });
    }

    let index = pipeline_index(input) % pipeline.len();
    // Try the scheduled agent first, then the rest of the pipeline in
    // order.
    let rotation = (0..pipeline.len()).map(|offset| {
        pipeline[(index + offset) % pipeline.len()].clone()
    });
    let agent = first_eligible(input, rotation).ok_or_else(|| no_eligible(input))?;

    Ok(RouteDecision {
        agent_id: agent.id.clone(),
        confidence: 1.0,
        rationale: format!("pipeline step {index}"),
        strategy: "orchestrator",
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// few_shot — LLM router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(serde::Deserialize)]
struct LlmChoice {
    agent_id: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Extract the structured decision from the router model's reply.
/// Tolerates code fences and surrounding prose.
pub(crate) fn parse_llm_choice(text: &str) -> Option<(String, String)> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let choice: LlmChoice = serde_json::from_str(&text[start..=end]).ok()?;
    if choice.agent_id.is_empty() {
        return None;
    }
    Some((
        choice.agent_id,
        choice.reason.unwrap_or_else(|| "llm decision".into()),
    ))
}

fn router_prompt(input: &RouteInput<'_>) -> (String, Vec<ChatMessage>) {
    let agents = input.snapshot.list_agents_for_domain(&input.domain.id);
    let mut roster = String::new();
    for agent in &agents {
        roster.push_str(&format!(
            "- {} ({}): {}\n",
            agent.id,
            agent.name,
            agent.capabilities.join(", ")
        ));
    }
    let system = format!(
        "You route user messages to the best-suited agent.\n\
         Agents:\n{roster}\
         Reply with exactly one JSON object: {{\"agent_id\": \"...\", \"reason\": \"...\"}}"
    );

    let mut messages = Vec::new();
    for example in &input.domain.few_shot_examples {
        messages.push(ChatMessage::user(example.user_message.clone()));
        messages.push(ChatMessage::assistant(
            serde_json::json!({
                "agent_id": example.agent_id,
                "reason": example.reason.clone().unwrap_or_default(),
            })
            .to_string(),
        ));
    }
    messages.push(ChatMessage::user(input.user_message.to_owned()));
    (system, messages)
}

async fn ask_router_llm(input: &RouteInput<'_>, pool: &ClientPool) -> Option<(String, String)> {
    let (system_prompt, messages) = router_prompt(input);
    let lease = pool.acquire(pool.default_model()).await.ok()?;
    let mut stream = lease
        .client
        .stream(
            StreamRequest {
                model_id: String::new(),
                system_prompt,
                messages,
                tools: Vec::new(),
            },
            CancelToken::new(),
        )
        .await
        .ok()?;

    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            LlmEvent::TokenChunk { text: chunk } => text.push_str(&chunk),
            LlmEvent::Completed { .. } => break,
            LlmEvent::StreamError { message, .. } => {
                tracing::warn!(error = %message, "router LLM stream failed");
                return None;
            }
            _ => {}
        }
    }
    parse_llm_choice(&text)
}

async fn few_shot(
    input: &RouteInput<'_>,
    pool: &ClientPool,
) -> Result<RouteDecision, NoEligibleAgent> {
    match ask_router_llm(input, pool).await {
        Some((agent_id, reason)) => {
            let candidates = std::iter::once(agent_id.clone());
            match first_eligible(input, candidates) {
                Some(agent) => Ok(RouteDecision {
                    agent_id: agent.id.clone(),
                    confidence: if agent.id == agent_id { 0.9 } else { 0.5 },
                    rationale: reason,
                    strategy: "few_shot",
                }),
                None => {
                    tracing::debug!(agent_id, "llm chose an ineligible agent; supervisor fallback");
                    supervisor(input)
                }
            }
        }
        None => {
            // Parse or transport failure: deterministic fallback.
            supervisor(input)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// hybrid — phase-switched
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn hybrid(
    input: &RouteInput<'_>,
    pool: &ClientPool,
) -> Result<RouteDecision, NoEligibleAgent> {
    let phases = &input.domain.hybrid_phases;
    if phases.is_empty() {
        return few_shot(input, pool).await;
    }
    let phase = phases[pipeline_index(input) % phases.len()];
    match phase {
        HybridPhase::Deterministic => orchestrator(input),
        HybridPhase::Llm => few_shot(input, pool).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_domain::config::{
        AgentState, ConfigFile, FewShotExample, RoutingRule,
    };
    use parley_domain::registry::ConfigRegistry;

    fn agent(id: &str, state: AgentState, keywords: &[&str]) -> parley_domain::config::AgentDef {
        parley_domain::config::AgentDef {
            id: id.into(),
            name: id.into(),
            model_id: "m".into(),
            system_prompt: "p".into(),
            tool_ids: Vec::new(),
            routing_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            capabilities: Vec::new(),
            state,
            version: "1.0.0".into(),
            domain_id: "d1".into(),
        }
    }

    fn build(
        workflow: WorkflowType,
        agents: Vec<parley_domain::config::AgentDef>,
        mutate: impl FnOnce(&mut DomainDef),
    ) -> (ConfigRegistry, String) {
        let mut domain = DomainDef {
            id: "d1".into(),
            name: "d1".into(),
            workflow_type: workflow,
            agent_ids: agents.iter().map(|a| a.id.clone()).collect(),
            default_agent_id: agents[0].id.clone(),
            fallback_agent_id: None,
            routing_rules: Vec::new(),
            allowed_roles: Vec::new(),
            orchestration_pipeline: Vec::new(),
            few_shot_examples: Vec::new(),
            hybrid_phases: Vec::new(),
            min_confidence_threshold: 0.2,
            max_handoffs: 5,
        };
        mutate(&mut domain);
        let registry = ConfigRegistry::from_file(&ConfigFile {
            domains: vec![domain],
            agents,
            tools: Vec::new(),
        })
        .unwrap();
        (registry, "d1".into())
    }

    fn assistant_msg(agent_id: &str) -> StoredMessage {
        StoredMessage {
            id: "m".into(),
            conversation_id: "c".into(),
            seq: 1,
            role: MessageRole::Assistant,
            content: "hi".into(),
            agent_id: Some(agent_id.into()),
            created_at: chrono::Utc::now(),
            metadata: None,
        }
    }

    async fn run_route(
        registry: &ConfigRegistry,
        message: &str,
        history: &[StoredMessage],
        testing_override: bool,
    ) -> Result<RouteDecision, NoEligibleAgent> {
        let snapshot = registry.snapshot();
        let domain = snapshot.get_domain("d1").unwrap();
        let input = RouteInput {
            domain: &domain,
            snapshot: &snapshot,
            user_message: message,
            history,
            requester_role: Role::User,
            testing_override,
        };
        // Empty pool: the few_shot LLM is unreachable, exercising the
        // supervisor fallback paths.
        route(&input, &ClientPool::new("none", 1)).await
    }

    #[tokio::test]
    async fn supervisor_picks_best_keyword_match() {
        let (registry, _) = build(
            WorkflowType::Supervisor,
            vec![
                agent("general", AgentState::Production, &[]),
                agent("coder", AgentState::Production, &["deploy", "rust"]),
            ],
            |_| {},
        );
        let decision = run_route(&registry, "please deploy the rust service", &[], false)
            .await
            .unwrap();
        assert_eq!(decision.agent_id, "coder");
        assert_eq!(decision.strategy, "supervisor");
        assert!(decision.confidence > 0.2);
    }

    #[tokio::test]
    async fn supervisor_priority_rules_outweigh_plain_keywords() {
        let (registry, _) = build(
            WorkflowType::Supervisor,
            vec![
                agent("a", AgentState::Production, &["widget"]),
                agent("b", AgentState::Production, &[]),
            ],
            |d| {
                d.routing_rules.push(RoutingRule {
                    keyword: "widget".into(),
                    agent_id: "b".into(),
                    priority: 3.0,
                });
            },
        );
        let decision = run_route(&registry, "make a widget", &[], false).await.unwrap();
        assert_eq!(decision.agent_id, "b");
    }

    #[tokio::test]
    async fn supervisor_continuity_bonus_breaks_ties() {
        let (registry, _) = build(
            WorkflowType::Supervisor,
            vec![
                agent("a", AgentState::Production, &["fix"]),
                agent("b", AgentState::Production, &["fix"]),
            ],
            |_| {},
        );
        let history = vec![assistant_msg("b")];
        let decision = run_route(&registry, "fix it", &history, false).await.unwrap();
        assert_eq!(decision.agent_id, "b");
    }

    #[tokio::test]
    async fn supervisor_below_threshold_uses_fallback() {
        let (registry, _) = build(
            WorkflowType::Supervisor,
            vec![
                agent("main", AgentState::Production, &["alpha"]),
                agent("catchall", AgentState::Production, &[]),
            ],
            |d| d.fallback_agent_id = Some("catchall".into()),
        );
        let decision = run_route(&registry, "nothing matches here", &[], false)
            .await
            .unwrap();
        assert_eq!(decision.agent_id, "catchall");
        assert!(decision.confidence < 0.2);
    }

    #[tokio::test]
    async fn testing_agents_need_override() {
        let (registry, _) = build(
            WorkflowType::Supervisor,
            vec![
                agent("stable", AgentState::Production, &[]),
                agent("beta", AgentState::Testing, &["beta"]),
            ],
            |_| {},
        );
        let without = run_route(&registry, "try the beta thing", &[], false)
            .await
            .unwrap();
        assert_eq!(without.agent_id, "stable");

        let with = run_route(&registry, "try the beta thing", &[], true)
            .await
            .unwrap();
        assert_eq!(with.agent_id, "beta");
    }

    #[tokio::test]
    async fn no_eligible_agent_when_everything_archived() {
        let (registry, _) = build(
            WorkflowType::Supervisor,
            vec![
                agent("old", AgentState::Archived, &[]),
                agent("older", AgentState::Deprecated, &[]),
            ],
            |_| {},
        );
        assert!(run_route(&registry, "hello", &[], false).await.is_err());
    }

    #[tokio::test]
    async fn orchestrator_walks_pipeline_by_turn() {
        let (registry, _) = build(
            WorkflowType::Orchestrator,
            vec![
                agent("planner", AgentState::Production, &[]),
                agent("builder", AgentState::Production, &[]),
            ],
            |d| {
                d.orchestration_pipeline = vec!["planner".into(), "builder".into()];
            },
        );

        let first = run_route(&registry, "go", &[], false).await.unwrap();
        assert_eq!(first.agent_id, "planner");

        let history = vec![assistant_msg("planner")];
        let second = run_route(&registry, "go", &history, false).await.unwrap();
        assert_eq!(second.agent_id, "builder");

        // Wraps around.
        let history = vec![assistant_msg("planner"), assistant_msg("builder")];
        let third = run_route(&registry, "go", &history, false).await.unwrap();
        assert_eq!(third.agent_id, "planner");
    }

    #[tokio::test]
    async fn orchestrator_skips_ineligible_step() {
        let (registry, _) = build(
            WorkflowType::Orchestrator,
            vec![
                agent("planner", AgentState::Deprecated, &[]),
                agent("builder", AgentState::Production, &[]),
            ],
            |d| {
                d.orchestration_pipeline = vec!["planner".into(), "builder".into()];
                d.default_agent_id = "builder".into();
            },
        );
        let decision = run_route(&registry, "go", &[], false).await.unwrap();
        assert_eq!(decision.agent_id, "builder");
    }

    #[tokio::test]
    async fn few_shot_without_llm_falls_back_to_supervisor() {
        let (registry, _) = build(
            WorkflowType::FewShot,
            vec![
                agent("general", AgentState::Production, &[]),
                agent("coder", AgentState::Production, &["compile"]),
            ],
            |d| {
                d.few_shot_examples = vec![FewShotExample {
                    user_message: "build my code".into(),
                    agent_id: "coder".into(),
                    reason: None,
                }];
            },
        );
        let decision = run_route(&registry, "compile this", &[], false).await.unwrap();
        assert_eq!(decision.agent_id, "coder");
        assert_eq!(decision.strategy, "supervisor");
    }

    #[tokio::test]
    async fn hybrid_deterministic_phase_uses_pipeline() {
        let (registry, _) = build(
            WorkflowType::Hybrid,
            vec![
                agent("planner", AgentState::Production, &[]),
                agent("builder", AgentState::Production, &[]),
            ],
            |d| {
                d.orchestration_pipeline = vec!["planner".into(), "builder".into()];
                d.hybrid_phases = vec![HybridPhase::Deterministic, HybridPhase::Llm];
            },
        );
        let decision = run_route(&registry, "go", &[], false).await.unwrap();
        assert_eq!(decision.agent_id, "planner");
        assert_eq!(decision.strategy, "orchestrator");
    }

    #[test]
    fn parse_llm_choice_tolerates_fences() {
        let text = "Sure!\n```json\n{\"agent_id\": \"coder\", \"reason\": \"code question\"}\n```";
        let (agent_id, reason) = parse_llm_choice(text).unwrap();
        assert_eq!(agent_id, "coder");
        assert_eq!(reason, "code question");
    }

    #[test]
    fn parse_llm_choice_rejects_garbage() {
        assert!(parse_llm_choice("no json here").is_none());
        assert!(parse_llm_choice("{\"agent_id\": \"\"}").is_none());
        assert!(parse_llm_choice("{\"other\": 1}").is_none());
    }

    #[test]
    fn keyword_matching_is_whole_word() {
        assert!(keyword_matches("please deploy now", "deploy"));
        assert!(keyword_matches("DEPLOY it", "deploy"));
        assert!(!keyword_matches("deployment pipeline", "deploy"));
        assert!(!keyword_matches("I am frustrated", "rust"));
    }
}
