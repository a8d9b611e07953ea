//! CloudEvents 1.0 envelope consumed by the correlation engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CLOUD_EVENT_SPEC_VERSION: &str = "1.0";

/// An inbound event in structured CloudEvents JSON form.
///
/// Extension attributes are flattened alongside the context attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    #[serde(rename = "specversion", default = "default_spec_version")]
    pub spec_version: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(rename = "datacontenttype", default, skip_serializing_if = "Option::is_none")]
    pub data_content_type: Option<String>,
    #[serde(rename = "dataschema", default, skip_serializing_if = "Option::is_none")]
    pub data_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

fn default_spec_version() -> String {
    CLOUD_EVENT_SPEC_VERSION.to_string()
}

impl CloudEvent {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            spec_version: default_spec_version(),
            event_type: event_type.into(),
            subject: None,
            data_content_type: None,
            data_schema: None,
            time: Some(Utc::now()),
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data_content_type = Some("application/json".to_string());
        self.data = Some(data);
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// Look up a context or extension attribute by its CloudEvents name.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "source" => Some(Value::String(self.source.clone())),
            "specversion" => Some(Value::String(self.spec_version.clone())),
            "type" => Some(Value::String(self.event_type.clone())),
            "subject" => self.subject.clone().map(Value::String),
            "datacontenttype" => self.data_content_type.clone().map(Value::String),
            "dataschema" => self.data_schema.clone().map(Value::String),
            "time" => self.time.map(|t| Value::String(t.to_rfc3339())),
            "data" => self.data.clone(),
            other => self.extensions.get(other).cloned(),
        }
    }

    /// Attribute rendered as a plain string (strings unquoted).
    pub fn attribute_str(&self, name: &str) -> Option<String> {
        self.attribute(name).map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    /// Structured JSON form, used as the data of event expressions.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
