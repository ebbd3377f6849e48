use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

/// Source stamped on events the hub itself emits.
pub const HUB_SOURCE: &str = "plugin-hub";

/// An immutable notification routed by the event bus.
///
/// Events with both `module_id` and `version` set are module events; they are
/// produced by [`Event::module`] and carry `module:<id>` as their source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Event {
    pub fn new(kind: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            source: source.into(),
            timestamp: Utc::now(),
            data,
            metadata: None,
            module_id: None,
            version: None,
        }
    }

    pub fn module(
        kind: impl Into<String>,
        module_id: impl Into<String>,
        version: impl Into<String>,
        data: Value,
    ) -> Self {
        let module_id = module_id.into();
        let mut event = Self::new(kind, format!("module:{module_id}"), data);
        event.module_id = Some(module_id);
        event.version = Some(version.into());
        event
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_module_event(&self) -> bool {
        self.module_id.is_some() && self.version.is_some()
    }
}
