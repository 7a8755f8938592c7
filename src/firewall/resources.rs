//! Resources of the cloud hierarchy which policies get attached to or evaluated against
use super::config_files::scalar_string;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),
    #[error("invalid full name \"{full_name}\": {reason}")]
    InvalidFullName { full_name: String, reason: String },
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[display("organization")]
    Organization,
    #[display("folder")]
    Folder,
    #[display("project")]
    Project,
    #[display("firewall_rule")]
    #[serde(alias = "firewall")]
    FirewallRule,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match &self {
            ResourceType::Organization => "organization",
            ResourceType::Folder => "folder",
            ResourceType::Project => "project",
            ResourceType::FirewallRule => "firewall_rule",
        }
    }
}

impl FromStr for ResourceType {
    type Err = ResourceError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(ResourceType::Organization),
            "folder" => Ok(ResourceType::Folder),
            "project" => Ok(ResourceType::Project),
            // full names use the shorter form
            "firewall" | "firewall_rule" => Ok(ResourceType::FirewallRule),
            _ => Err(ResourceError::UnknownResourceType(s.to_string())),
        }
    }
}

/// Identifies a resource in the org policy index
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, id: &str) -> Self {
        Self {
            resource_type,
            id: id.to_string(),
        }
    }
}

/// A node of the resource hierarchy.
///
/// `full_name` is the path from the root, e.g. `organization/1/folder/2/project/p/`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(deserialize_with = "scalar_string")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

impl Resource {
    pub fn new(resource_type: ResourceType, id: &str) -> Self {
        Self {
            resource_type,
            id: id.to_string(),
            full_name: None,
        }
    }

    pub fn with_full_name(self, full_name: &str) -> Self {
        Self {
            full_name: Some(full_name.to_string()),
            ..self
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type, &self.id)
    }
}
