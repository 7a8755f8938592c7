//! Snapshot of the live firewall rules of a set of resources
use super::config_files::FirewallRuleDefinition;
use super::records::FirewallRuleRecord;
use super::resources::Resource;
use super::rules::{FirewallRule, FirewallRuleError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InventoryEntry {
    pub resource: Resource,
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRuleDefinition>,
}

impl InventoryEntry {
    /// Full name of a firewall rule of this resource
    fn rule_full_name(&self, def: &FirewallRuleDefinition) -> String {
        let parent = self.resource.full_name.as_deref().unwrap_or_default();
        let separator = if parent.is_empty() || parent.ends_with('/') { "" } else { "/" };

        let id = def
            .id
            .as_ref()
            .map(|id| id.to_string())
            .or_else(|| def.name.clone())
            .unwrap_or_default();

        format!("{}{}firewall/{}/", parent, separator, id)
    }

    /// Builds the live firewall rules of the resource. Rules don't get validated: a
    /// live rule is whatever the cloud API accepted.
    pub fn live_policies(&self) -> Result<Vec<FirewallRule>, FirewallRuleError> {
        let project_id = self.resource.id.as_str();

        self.firewall_rules
            .iter()
            .map(|def| {
                let record = FirewallRuleRecord::from_definition(def, Some(project_id))
                    .map_err(|e| FirewallRuleError::InvalidRule(e.to_string()))?
                    .with_full_name(&self.rule_full_name(def));

                FirewallRule::from_record(&record, false)
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Inventory {
    #[serde(default)]
    pub resources: Vec<InventoryEntry>,
}

impl Inventory {
    /// Loads an inventory snapshot; `.json` files are read as JSON, anything else as YAML
    pub fn load(path: &Path) -> Result<Inventory> {
        info!("loading inventory: {}", path.display());

        let data = fs::read_to_string(path).with_context(|| format!("cannot read inventory from {}", path.display()))?;

        let inventory = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&data).map_err(anyhow::Error::from),
            _ => serde_yaml::from_str(&data).map_err(anyhow::Error::from),
        };

        inventory.with_context(|| format!("cannot parse {}", path.display()))
    }

    /// Resources along with their live firewall rules. A resource with a malformed rule
    /// is left out.
    pub fn live_policies(&self) -> Vec<(Resource, Vec<FirewallRule>)> {
        self.resources
            .iter()
            .filter_map(|entry| match entry.live_policies() {
                Ok(policies) => Some((entry.resource.clone(), policies)),
                Err(e) => {
                    warn!(
                        "skipping {}/{}: {}",
                        entry.resource.resource_type, entry.resource.id, e
                    );
                    None
                }
            })
            .collect()
    }
}
