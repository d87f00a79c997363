//! Config registry — the read-mostly snapshot of all domains, agents, and
//! tools.
//!
//! Reload is atomic: a full snapshot is built and validated, then a single
//! `Arc` is swapped so readers never observe a half-loaded state. A reload
//! that fails referential integrity is rejected wholesale and the previous
//! snapshot is retained.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::config::{AgentDef, ConfigFile, DomainDef, ToolDef};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An immutable, fully-validated view of the configuration.
#[derive(Debug)]
pub struct Snapshot {
    domains: HashMap<String, Arc<DomainDef>>,
    agents: HashMap<String, Arc<AgentDef>>,
    tools: HashMap<String, Arc<ToolDef>>,
    /// SHA-256 over the canonical JSON rendering, hex-encoded.
    hash: String,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            domains: HashMap::new(),
            agents: HashMap::new(),
            tools: HashMap::new(),
            hash: hash_config(&ConfigFile::default()),
            loaded_at: crate::ids::now(),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn get_domain(&self, id: &str) -> Option<Arc<DomainDef>> {
        self.domains.get(id).cloned()
    }

    pub fn get_agent(&self, id: &str) -> Option<Arc<AgentDef>> {
        self.agents.get(id).cloned()
    }

    pub fn get_tool(&self, id: &str) -> Option<Arc<ToolDef>> {
        self.tools.get(id).cloned()
    }

    pub fn list_domains(&self) -> Vec<Arc<DomainDef>> {
        let mut out: Vec<_> = self.domains.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn list_tools(&self) -> Vec<Arc<ToolDef>> {
        let mut out: Vec<_> = self.tools.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Agents of a domain, in the order the domain declares them.
    pub fn list_agents_for_domain(&self, domain_id: &str) -> Vec<Arc<AgentDef>> {
        let Some(domain) = self.domains.get(domain_id) else {
            return Vec::new();
        };
        domain
            .agent_ids
            .iter()
            .filter_map(|id| self.agents.get(id).cloned())
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A rejected reload. The previous snapshot stays in effect.
#[derive(Debug, thiserror::Error)]
#[error("config invalid: {reason}")]
pub struct ConfigInvalid {
    pub reason: String,
}

fn invalid(reason: impl Into<String>) -> ConfigInvalid {
    ConfigInvalid {
        reason: reason.into(),
    }
}

fn build_snapshot(file: &ConfigFile) -> Result<Snapshot, ConfigInvalid> {
    let mut domains = HashMap::new();
    for d in &file.domains {
        if domains
            .insert(d.id.clone(), Arc::new(d.clone()))
            .is_some()
        {
            return Err(invalid(format!("duplicate domain id {:?}", d.id)));
        }
    }
    let mut agents = HashMap::new();
    for a in &file.agents {
        if agents.insert(a.id.clone(), Arc::new(a.clone())).is_some() {
            return Err(invalid(format!("duplicate agent id {:?}", a.id)));
        }
    }
    let mut tools = HashMap::new();
    for t in &file.tools {
        if tools.insert(t.id.clone(), Arc::new(t.clone())).is_some() {
            return Err(invalid(format!("duplicate tool id {:?}", t.id)));
        }
    }

    // Referential integrity. Any violation rejects the whole snapshot.
    for a in file.agents.iter() {
        if !domains.contains_key(&a.domain_id) {
            return Err(invalid(format!(
                "agent {:?} references missing domain {:?}",
                a.id, a.domain_id
            )));
        }
        for tool_id in &a.tool_ids {
            if !tools.contains_key(tool_id) {
                return Err(invalid(format!(
                    "agent {:?} references missing tool {:?}",
                    a.id, tool_id
                )));
            }
        }
    }
    for d in file.domains.iter() {
        let member = |agent_id: &String| {
            agents
                .get(agent_id)
                .is_some_and(|a: &Arc<AgentDef>| a.domain_id == d.id)
        };
        for agent_id in &d.agent_ids {
            if !member(agent_id) {
                return Err(invalid(format!(
                    "domain {:?} lists agent {:?} which does not exist in it",
                    d.id, agent_id
                )));
            }
        }
        if !member(&d.default_agent_id) {
            return Err(invalid(format!(
                "domain {:?} default agent {:?} is not a member",
                d.id, d.default_agent_id
            )));
        }
        if let Some(fb) = &d.fallback_agent_id {
            if !member(fb) {
                return Err(invalid(format!(
                    "domain {:?} fallback agent {:?} is not a member",
                    d.id, fb
                )));
            }
        }
        for rule in &d.routing_rules {
            if !member(&rule.agent_id) {
                return Err(invalid(format!(
                    "domain {:?} routing rule {:?} references missing agent {:?}",
                    d.id, rule.keyword, rule.agent_id
                )));
            }
        }
        for agent_id in &d.orchestration_pipeline {
            if !member(agent_id) {
                return Err(invalid(format!(
                    "domain {:?} pipeline references missing agent {:?}",
                    d.id, agent_id
                )));
            }
        }
        for ex in &d.few_shot_examples {
            if !member(&ex.agent_id) {
                return Err(invalid(format!(
                    "domain {:?} few-shot example references missing agent {:?}",
                    d.id, ex.agent_id
                )));
            }
        }
    }

    Ok(Snapshot {
        domains,
        agents,
        tools,
        hash: hash_config(file),
        loaded_at: crate::ids::now(),
    })
}

/// Canonical hash of a config file: ids sorted, serialized to JSON,
/// SHA-256, hex. Two reloads of the same content hash identically.
fn hash_config(file: &ConfigFile) -> String {
    let mut canonical = file.clone();
    canonical.domains.sort_by(|a, b| a.id.cmp(&b.id));
    canonical.agents.sort_by(|a, b| a.id.cmp(&b.id));
    canonical.tools.sort_by(|a, b| a.id.cmp(&b.id));
    let json = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a successful reload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReloadReport {
    pub hash: String,
    pub domains: usize,
    pub agents: usize,
    pub tools: usize,
    /// False when the new snapshot hashes identically to the old one.
    pub changed: bool,
}

/// Holds the current snapshot behind a lock-free-read `Arc` swap.
#[derive(Debug)]
pub struct ConfigRegistry {
    current: RwLock<Arc<Snapshot>>,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty())),
        }
    }

    pub fn from_file(file: &ConfigFile) -> Result<Self, ConfigInvalid> {
        let snapshot = build_snapshot(file)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// The current snapshot. Cheap; callers hold the `Arc` for the whole
    /// operation so a concurrent reload never changes what they see.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn snapshot_hash(&self) -> String {
        self.current.read().hash().to_string()
    }

    /// Build, validate, and atomically install a new snapshot. On error the
    /// previous snapshot is retained.
    pub fn reload(&self, file: &ConfigFile) -> Result<ReloadReport, ConfigInvalid> {
        let snapshot = build_snapshot(file)?;
        let report = ReloadReport {
            hash: snapshot.hash().to_string(),
            domains: snapshot.domain_count(),
            agents: snapshot.agent_count(),
            tools: snapshot.tool_count(),
            changed: snapshot.hash() != self.snapshot_hash(),
        };
        *self.current.write() = Arc::new(snapshot);
        tracing::info!(
            hash = %report.hash,
            domains = report.domains,
            agents = report.agents,
            tools = report.tools,
            changed = report.changed,
            "config snapshot installed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentDef, AgentState, DomainDef, RoutingRule, WorkflowType};

    fn agent(id: &str, domain_id: &str) -> AgentDef {
        AgentDef {
            id: id.into(),
            name: id.into(),
            model_id: "gpt-4o".into(),
            system_prompt: "prompt".into(),
            tool_ids: Vec::new(),
            routing_keywords: Vec::new(),
            capabilities: Vec::new(),
            state: AgentState::Production,
            version: "1.0.0".into(),
            domain_id: domain_id.into(),
        }
    }

    fn domain(id: &str, agents: &[&str]) -> DomainDef {
        DomainDef {
            id: id.into(),
            name: id.into(),
            workflow_type: WorkflowType::Supervisor,
            agent_ids: agents.iter().map(|s| s.to_string()).collect(),
            default_agent_id: agents[0].into(),
            fallback_agent_id: None,
            routing_rules: Vec::new(),
            allowed_roles: Vec::new(),
            orchestration_pipeline: Vec::new(),
            few_shot_examples: Vec::new(),
            hybrid_phases: Vec::new(),
            min_confidence_threshold: 0.2,
            max_handoffs: 5,
        }
    }

    fn valid_file() -> ConfigFile {
        ConfigFile {
            domains: vec![domain("d1", &["a1", "a2"])],
            agents: vec![agent("a1", "d1"), agent("a2", "d1")],
            tools: Vec::new(),
        }
    }

    #[test]
    fn valid_file_loads() {
        let reg = ConfigRegistry::from_file(&valid_file()).unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.domain_count(), 1);
        assert_eq!(snap.list_agents_for_domain("d1").len(), 2);
        assert!(snap.get_agent("a1").is_some());
        assert!(snap.get_agent("nope").is_none());
    }

    #[test]
    fn missing_agent_rejects_whole_snapshot() {
        let mut file = valid_file();
        file.domains[0].agent_ids.push("ghost".into());
        let err = ConfigRegistry::from_file(&file).unwrap_err();
        assert!(err.reason.contains("ghost"));
    }

    #[test]
    fn routing_rule_to_missing_agent_rejected() {
        let mut file = valid_file();
        file.domains[0].routing_rules.push(RoutingRule {
            keyword: "deploy".into(),
            agent_id: "ghost".into(),
            priority: 1.0,
        });
        assert!(ConfigRegistry::from_file(&file).is_err());
    }

    #[test]
    fn agent_tool_reference_checked() {
        let mut file = valid_file();
        file.agents[0].tool_ids.push("missing_tool".into());
        assert!(ConfigRegistry::from_file(&file).is_err());
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let reg = ConfigRegistry::from_file(&valid_file()).unwrap();
        let before = reg.snapshot_hash();

        let mut broken = valid_file();
        broken.agents[0].domain_id = "nowhere".into();
        assert!(reg.reload(&broken).is_err());
        assert_eq!(reg.snapshot_hash(), before);
        assert_eq!(reg.snapshot().domain_count(), 1);
    }

    #[test]
    fn reload_is_idempotent() {
        let reg = ConfigRegistry::from_file(&valid_file()).unwrap();
        let first = reg.reload(&valid_file()).unwrap();
        assert!(!first.changed);
        let second = reg.reload(&valid_file()).unwrap();
        assert_eq!(first.hash, second.hash);
        assert!(!second.changed);
    }

    #[test]
    fn hash_ignores_declaration_order() {
        let mut reordered = valid_file();
        reordered.agents.reverse();
        assert_eq!(hash_config(&valid_file()), hash_config(&reordered));
    }

    #[test]
    fn fallback_must_be_member() {
        let mut file = valid_file();
        file.domains[0].fallback_agent_id = Some("ghost".into());
        assert!(ConfigRegistry::from_file(&file).is_err());
    }
}
