//! Resource envelope shared by every persisted aggregate.
//!
//! Workflows, workflow instances and correlations are all stored as named,
//! namespaced, labelled and versioned documents. The repository uses
//! `resource_version` for compare-and-swap writes, and controllers use labels
//! to mark ownership.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Well-known label keys.
pub mod labels {
    /// Qualified name of the correlator owning a correlation.
    pub const CORRELATOR: &str = "synapse.io/correlator";
    /// Qualified name of the runner owning a workflow instance.
    pub const RUNNER: &str = "synapse.io/runner";
    /// Correlation that started a workflow instance.
    pub const CORRELATION: &str = "synapse.io/correlation";
    /// Instance a sub-flow instance or listen correlation belongs to.
    pub const PARENT_INSTANCE: &str = "synapse.io/parent-instance";
    /// Activity a sub-flow instance or listen correlation belongs to.
    pub const PARENT_ACTIVITY: &str = "synapse.io/parent-activity";
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Identity, labels and version of a stored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub name: String,
    pub namespace: String,
    /// `None` rather than an empty map when no label is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Bumped by the repository on every successful write.
    #[serde(default)]
    pub resource_version: u64,
    pub creation_timestamp: DateTime<Utc>,
}

impl ResourceMetadata {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: None,
            resource_version: 0,
            creation_timestamp: Utc::now(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_label(key, value);
        self
    }

    /// `name.namespace`, the form used for owner labels and log fields.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// Remove a label, nulling the whole map once it is empty.
    pub fn remove_label(&mut self, key: &str) -> Option<String> {
        let labels = self.labels.as_mut()?;
        let removed = labels.remove(key);
        if labels.is_empty() {
            self.labels = None;
        }
        removed
    }
}

/// A persisted aggregate addressable by name and namespace.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind discriminator, also used as the storage partition.
    const KIND: &'static str;

    fn metadata(&self) -> &ResourceMetadata;

    fn metadata_mut(&mut self) -> &mut ResourceMetadata;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    fn namespace(&self) -> &str {
        &self.metadata().namespace
    }

    fn qualified_name(&self) -> String {
        self.metadata().qualified_name()
    }

    fn resource_version(&self) -> u64 {
        self.metadata().resource_version
    }
}

// ---------------------------------------------------------------------------
// Label selectors
// ---------------------------------------------------------------------------

/// A single label constraint used when listing or watching resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSelector {
    /// `key=value`
    Equals { key: String, value: String },
    /// `key`
    Exists(String),
    /// `!key`
    NotExists(String),
}

impl LabelSelector {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match self {
            LabelSelector::Equals { key, value } => {
                labels.and_then(|l| l.get(key)).is_some_and(|v| v == value)
            }
            LabelSelector::Exists(key) => labels.is_some_and(|l| l.contains_key(key)),
            LabelSelector::NotExists(key) => !labels.is_some_and(|l| l.contains_key(key)),
        }
    }

    /// Whether every selector matches. An empty slice matches everything.
    pub fn matches_all(selectors: &[LabelSelector], labels: Option<&BTreeMap<String, String>>) -> bool {
        selectors.iter().all(|s| s.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelSelector::Equals { key, value } => write!(f, "{key}={value}"),
            LabelSelector::Exists(key) => write!(f, "{key}"),
            LabelSelector::NotExists(key) => write!(f, "!{key}"),
        }
    }
}

/// Error returned when a label selector string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label selector '{0}'")]
pub struct LabelSelectorError(pub String);

impl FromStr for LabelSelector {
    type Err = LabelSelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(key) = s.strip_prefix('!') {
            let key = key.trim();
            if key.is_empty() || key.contains('=') {
                return Err(LabelSelectorError(s.to_string()));
            }
            return Ok(LabelSelector::NotExists(key.to_string()));
        }
        match s.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(LabelSelectorError(s.to_string()));
                }
                Ok(LabelSelector::equals(key, value.trim()))
            }
            None if !s.is_empty() => Ok(LabelSelector::Exists(s.to_string())),
            None => Err(LabelSelectorError(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Watch events
// ---------------------------------------------------------------------------

/// A change notification emitted by a repository watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "resource", rename_all = "snake_case")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn resource(&self) -> &T {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }

    pub fn into_resource(self) -> T {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, WatchEvent::Deleted(_))
    }
}
