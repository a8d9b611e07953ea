//! Correlation resource types.
//!
//! A `Correlation` is a standing rule: inbound cloud events are matched
//! against its filters, accumulated into contexts keyed by correlation keys,
//! and once a context satisfies the consumption strategy the outcome fires
//! (start a new workflow instance, or feed a waiting one).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event::CloudEvent;
use crate::resource::{Resource, ResourceMetadata};

// ---------------------------------------------------------------------------
// Event filters
// ---------------------------------------------------------------------------

/// A set of event filters and how many of them must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConsumptionStrategy {
    #[serde(default)]
    pub strategy: ConsumptionMode,
    pub filters: Vec<EventFilter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionMode {
    /// Every filter must be matched by some event.
    #[default]
    All,
    /// A single event matching any filter suffices.
    Any,
    /// Exactly one filter is declared and it must match.
    One,
}

/// Constraints a single event must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Attribute name to a runtime-expression predicate or a
    /// case-insensitive regular expression.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Correlation keys extracted from matching events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlate: Vec<CorrelationKeyDefinition>,
}

/// How one correlation key is resolved from an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationKeyDefinition {
    pub key: String,
    /// Attribute name, or a runtime expression over the event.
    pub from: String,
    /// Required value; when set, events resolving another value do not match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
}

// ---------------------------------------------------------------------------
// Correlation resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub metadata: ResourceMetadata,
    pub spec: CorrelationSpec,
    #[serde(default)]
    pub status: CorrelationStatus,
}

impl Resource for Correlation {
    const KIND: &'static str = "Correlation";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}

impl Correlation {
    pub fn new(metadata: ResourceMetadata, spec: CorrelationSpec) -> Self {
        Self {
            metadata,
            spec,
            status: CorrelationStatus::default(),
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.spec.lifetime == CorrelationLifetime::Ephemeral
    }

    /// Contexts still accumulating events.
    pub fn active_contexts(&self) -> impl Iterator<Item = &CorrelationContext> {
        self.status
            .contexts
            .iter()
            .filter(|c| c.status == CorrelationContextStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSpec {
    #[serde(default)]
    pub lifetime: CorrelationLifetime,
    /// Attribute equality constraints applied to every event before filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
    pub events: EventConsumptionStrategy,
    pub outcome: CorrelationOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationLifetime {
    /// Fires once, then the correlation is completed and removed.
    Ephemeral,
    /// Keeps correlating after each outcome.
    #[default]
    Durable,
}

/// What a satisfied correlation context triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CorrelationOutcome {
    /// Start a new instance of a workflow.
    Start {
        workflow: String,
        /// Defaults to the correlation's namespace.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        /// Exact version; latest when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Deliver the context to a task of a waiting instance.
    Correlate {
        instance: String,
        /// Defaults to the correlation's namespace.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        /// Id of the activity awaiting the events.
        task: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationStatus {
    #[serde(default)]
    pub phase: CorrelationPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<CorrelationContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationPhase {
    #[default]
    Pending,
    Active,
    Completed,
}

// ---------------------------------------------------------------------------
// Correlation context
// ---------------------------------------------------------------------------

/// Events and keys accumulated towards one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// Id of the first event matched into this context.
    pub id: String,
    #[serde(default)]
    pub status: CorrelationContextStatus,
    /// Filter index to the event that satisfied it.
    #[serde(default)]
    pub events: BTreeMap<usize, CloudEvent>,
    /// Resolved correlation keys.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

impl CorrelationContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: CorrelationContextStatus::Active,
            events: BTreeMap::new(),
            keys: BTreeMap::new(),
        }
    }

    pub fn contains_event(&self, event_id: &str) -> bool {
        self.events.values().any(|e| e.id == event_id)
    }

    /// Document handed to workflows: keys plus matched events in filter order.
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "keys": self.keys,
            "events": self.events.values().map(CloudEvent::to_value).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationContextStatus {
    #[default]
    Active,
    Completed,
}
