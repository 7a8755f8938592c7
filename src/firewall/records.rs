//! Storage form of a firewall rule.
//!
//! API field names are renamed to canonical ones and compound fields (lists, action
//! entries) are kept as JSON strings, the way snapshot tables store them.
use super::config_files::FirewallRuleDefinition;
use serde::{Deserialize, Serialize};

/// Default `kind` of compute firewall rules
pub const FIREWALL_RULE_KIND: &str = "compute#firewall";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleRecord {
    pub project_id: Option<String>,
    pub full_name: Option<String>,
    pub firewall_rule_id: Option<String>,
    pub firewall_rule_name: Option<String>,
    pub firewall_rule_description: Option<String>,
    pub firewall_rule_kind: Option<String>,
    pub firewall_rule_network: Option<String>,
    pub firewall_rule_priority: Option<String>,
    pub firewall_rule_direction: Option<String>,
    pub firewall_rule_source_ranges: Option<String>,
    pub firewall_rule_destination_ranges: Option<String>,
    pub firewall_rule_source_tags: Option<String>,
    pub firewall_rule_target_tags: Option<String>,
    pub firewall_rule_source_service_accounts: Option<String>,
    pub firewall_rule_target_service_accounts: Option<String>,
    pub firewall_rule_allowed: Option<String>,
    pub firewall_rule_denied: Option<String>,
    pub firewall_rule_disabled: Option<bool>,
    pub firewall_rule_create_time: Option<String>,
}

fn to_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>, serde_json::Error> {
    value.as_ref().map(serde_json::to_string).transpose()
}

impl FirewallRuleRecord {
    /// Transforms an API-shaped rule into its storage form
    pub fn from_definition(
        def: &FirewallRuleDefinition,
        project_id: Option<&str>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            project_id: project_id.map(str::to_string),
            full_name: None,
            firewall_rule_id: def.id.as_ref().map(|id| id.to_string()),
            firewall_rule_name: def.name.clone(),
            firewall_rule_description: def.description.clone(),
            firewall_rule_kind: Some(
                def.kind
                    .clone()
                    .unwrap_or_else(|| FIREWALL_RULE_KIND.to_string()),
            ),
            firewall_rule_network: def.network.clone(),
            firewall_rule_priority: def.priority.as_ref().map(|p| p.to_string()),
            firewall_rule_direction: def.direction.clone(),
            firewall_rule_source_ranges: to_json(&def.source_ranges)?,
            firewall_rule_destination_ranges: to_json(&def.destination_ranges)?,
            firewall_rule_source_tags: to_json(&def.source_tags)?,
            firewall_rule_target_tags: to_json(&def.target_tags)?,
            firewall_rule_source_service_accounts: to_json(&def.source_service_accounts)?,
            firewall_rule_target_service_accounts: to_json(&def.target_service_accounts)?,
            firewall_rule_allowed: to_json(&def.allowed)?,
            firewall_rule_denied: to_json(&def.denied)?,
            firewall_rule_disabled: def.disabled,
            firewall_rule_create_time: def.creation_timestamp.clone(),
        })
    }

    pub fn with_full_name(self, full_name: &str) -> Self {
        Self {
            full_name: Some(full_name.to_string()),
            ..self
        }
    }
}
