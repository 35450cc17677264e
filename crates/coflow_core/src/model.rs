//! Workflow graph model.
//!
//! Plain, serializable representations of the workflow document: jobs,
//! triggers, edges and node positions. These are the flattened forms of the
//! shared CRDT document ([`crate::doc::WorkflowDoc`]) and the state the
//! patch ledger operates on. They carry no synchronization machinery.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A job node: a unit of work executed by an adaptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable identifier, immutable once created.
    pub id: Uuid,

    /// Display name, 1-100 chars from a constrained character set.
    pub name: String,

    /// Job body source. Collaboratively edited as a CRDT text sequence;
    /// this field holds the flattened string form.
    #[serde(default)]
    pub body: String,

    /// Adaptor specifier, e.g. `@openfn/language-http@6.0.0`.
    pub adaptor: String,

    /// Project-scoped credential reference. Mutually exclusive with
    /// `keychain_credential_id`.
    #[serde(default)]
    pub project_credential_id: Option<Uuid>,

    /// Keychain credential reference. Mutually exclusive with
    /// `project_credential_id`.
    #[serde(default)]
    pub keychain_credential_id: Option<Uuid>,
}

impl Job {
    /// Create a job with a fresh id and empty body.
    pub fn new(name: impl Into<String>, adaptor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            body: String::new(),
            adaptor: adaptor.into(),
            project_credential_id: None,
            keychain_credential_id: None,
        }
    }
}

/// SASL authentication for a Kafka trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaslConfig {
    /// Mechanism name, e.g. `plain` or `scram_sha_256`.
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

/// Broker/topic configuration for a Kafka trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Broker addresses as `host:port` strings. Must be non-empty.
    pub hosts: Vec<String>,

    /// Topics to consume. Must be non-empty.
    pub topics: Vec<String>,

    /// Where to start consuming when no committed offset exists.
    #[serde(default = "default_offset_reset")]
    pub initial_offset_reset_policy: String,

    /// Optional SASL authentication.
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
}

fn default_offset_reset() -> String {
    "latest".to_string()
}

/// The discriminated trigger type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fired by an inbound HTTP request.
    Webhook,
    /// Fired on a schedule. The expression must be a valid 5-field cron.
    Cron { expression: String },
    /// Fired by messages on a Kafka topic.
    Kafka { configuration: KafkaConfig },
}

/// A trigger node: the entry point of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: TriggerKind,
    pub enabled: bool,
}

impl Trigger {
    /// Create an enabled trigger with a fresh id.
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            enabled: true,
        }
    }
}

/// Condition deciding whether an edge fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    OnJobSuccess,
    OnJobFailure,
    Always,
    JsExpression,
}

/// A directed edge from a job or trigger to a target job.
///
/// A committed edge has exactly one source reference set; transient
/// placeholder edges may have neither until committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,

    /// Source job. Mutually exclusive with `source_trigger_id`.
    #[serde(default)]
    pub source_job_id: Option<Uuid>,

    /// Source trigger. Mutually exclusive with `source_job_id`.
    #[serde(default)]
    pub source_trigger_id: Option<Uuid>,

    pub target_job_id: Uuid,

    pub condition_type: EdgeCondition,

    /// Javascript condition body, required when `condition_type` is
    /// `JsExpression`.
    #[serde(default)]
    pub condition_expression: Option<String>,

    /// Stored enabled flag, defaults true. The snapshot reports a derived
    /// value: an edge leaving a disabled trigger reads as disabled
    /// regardless of this flag.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Edge {
    /// Create an edge from a job to a job.
    pub fn from_job(source: Uuid, target: Uuid, condition: EdgeCondition) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_job_id: Some(source),
            source_trigger_id: None,
            target_job_id: target,
            condition_type: condition,
            condition_expression: None,
            enabled: true,
        }
    }

    /// Create an edge from a trigger to a job.
    pub fn from_trigger(source: Uuid, target: Uuid, condition: EdgeCondition) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_job_id: None,
            source_trigger_id: Some(source),
            target_job_id: target,
            condition_type: condition,
            condition_expression: None,
            enabled: true,
        }
    }

    /// True if exactly one source reference is set.
    pub fn has_valid_source(&self) -> bool {
        self.source_job_id.is_some() != self.source_trigger_id.is_some()
    }
}

/// Diagram position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// The currently selected node, if any. Selecting one kind clears the
/// others; this enum makes the exclusivity structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SelectedNode {
    Job(Uuid),
    Trigger(Uuid),
    Edge(Uuid),
}

impl SelectedNode {
    /// The id regardless of node kind.
    pub fn id(&self) -> Uuid {
        match self {
            SelectedNode::Job(id) | SelectedNode::Trigger(id) | SelectedNode::Edge(id) => *id,
        }
    }
}

/// The flattened workflow graph: the canonical materialized document.
///
/// Collections preserve insertion/merge order (the CRDT sequence order),
/// indexed by id for O(1) lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub jobs: IndexMap<Uuid, Job>,
    pub triggers: IndexMap<Uuid, Trigger>,
    pub edges: IndexMap<Uuid, Edge>,
    pub positions: HashMap<Uuid, Position>,
}

impl WorkflowState {
    /// Derived workflow-level enabled flag.
    ///
    /// `None` when there are no triggers at all (not `Some(false)`),
    /// `Some(true)` if any trigger is enabled, `Some(false)` otherwise.
    pub fn derived_enabled(&self) -> Option<bool> {
        if self.triggers.is_empty() {
            None
        } else {
            Some(self.triggers.values().any(|t| t.enabled))
        }
    }

    /// Effective enabled flag for an edge: an edge leaving a disabled
    /// trigger reads as disabled, overriding its stored flag.
    pub fn edge_effective_enabled(&self, edge: &Edge) -> bool {
        if let Some(trigger_id) = edge.source_trigger_id
            && let Some(trigger) = self.triggers.get(&trigger_id)
            && !trigger.enabled
        {
            return false;
        }
        edge.enabled
    }

    /// Edges whose source or target no longer resolves to an existing node.
    ///
    /// Concurrent remote merges can produce these even though local commands
    /// reject them; they are surfaced rather than silently dropped.
    pub fn dangling_edge_ids(&self) -> Vec<Uuid> {
        self.edges
            .values()
            .filter(|e| !self.edge_endpoints_exist(e))
            .map(|e| e.id)
            .collect()
    }

    fn edge_endpoints_exist(&self, edge: &Edge) -> bool {
        if !self.jobs.contains_key(&edge.target_job_id) {
            return false;
        }
        match (edge.source_job_id, edge.source_trigger_id) {
            (Some(job), None) => self.jobs.contains_key(&job),
            (None, Some(trigger)) => self.triggers.contains_key(&trigger),
            _ => false,
        }
    }

    /// True if any node (job, trigger or edge) exists with this id.
    pub fn node_exists(&self, id: Uuid) -> bool {
        self.jobs.contains_key(&id)
            || self.triggers.contains_key(&id)
            || self.edges.contains_key(&id)
    }

    /// True if a selection still refers to an existing node.
    pub fn selection_exists(&self, selected: &SelectedNode) -> bool {
        match selected {
            SelectedNode::Job(id) => self.jobs.contains_key(id),
            SelectedNode::Trigger(id) => self.triggers.contains_key(id),
            SelectedNode::Edge(id) => self.edges.contains_key(id),
        }
    }

    /// Edges incident on a job, as (edge id, is_target) pairs.
    pub fn edges_touching_job(&self, job_id: Uuid) -> Vec<Uuid> {
        self.edges
            .values()
            .filter(|e| e.target_job_id == job_id || e.source_job_id == Some(job_id))
            .map(|e| e.id)
            .collect()
    }

    /// Edges whose source is the given trigger.
    pub fn edges_from_trigger(&self, trigger_id: Uuid) -> Vec<Uuid> {
        self.edges
            .values()
            .filter(|e| e.source_trigger_id == Some(trigger_id))
            .map(|e| e.id)
            .collect()
    }
}
