use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    Service,
    Plugin,
    Wasm,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEngine {
    Node,
    Wasm,
    Docker,
    Native,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResourceLimits {
    pub cpu: String,
    pub memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRuntime {
    pub engine: RuntimeEngine,
    pub entrypoint: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ApiEndpoint {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EventDirection {
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub direction: EventDirection,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ModuleApi {
    #[serde(default)]
    pub endpoints: Vec<ApiEndpoint>,
    #[serde(default)]
    pub events: Vec<EventDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Service,
    Api,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDependency {
    pub module_id: String,
    pub version: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(rename = "type")]
    pub kind: DependencyKind,
}

/// A deployable unit. Unlike services, modules are never expired; they stay
/// until explicitly unregistered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: ModuleType,
    #[serde(default)]
    pub manifest: ModuleManifest,
    pub runtime: ModuleRuntime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ModuleApi>,
    #[serde(default)]
    pub dependencies: Vec<ModuleDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

impl ModuleRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        kind: ModuleType,
        runtime: ModuleRuntime,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            kind,
            manifest: ModuleManifest::default(),
            runtime,
            api: None,
            dependencies: Vec::new(),
            registered_at: None,
        }
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.id.trim().is_empty() {
            missing.push("id");
        }
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.version.trim().is_empty() {
            missing.push("version");
        }
        if self.runtime.entrypoint.trim().is_empty() {
            missing.push("runtime.entrypoint");
        }
        missing
    }
}

impl ModuleRuntime {
    pub fn new(engine: RuntimeEngine, entrypoint: impl Into<String>) -> Self {
        Self {
            engine,
            entrypoint: entrypoint.into(),
            environment: HashMap::new(),
            resources: None,
        }
    }
}
