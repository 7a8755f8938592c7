//! Findings reported when live firewall rules don't comply with a policy rule
use super::resources::ResourceType;
use derive_more::Display;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize)]
pub enum ViolationType {
    #[display("FIREWALL_MATCHES_VIOLATION")]
    #[serde(rename = "FIREWALL_MATCHES_VIOLATION")]
    Matches,
    #[display("FIREWALL_REQUIRED_VIOLATION")]
    #[serde(rename = "FIREWALL_REQUIRED_VIOLATION")]
    Required,
    #[display("FIREWALL_WHITELIST_VIOLATION")]
    #[serde(rename = "FIREWALL_WHITELIST_VIOLATION")]
    Whitelist,
    #[display("FIREWALL_BLACKLIST_VIOLATION")]
    #[serde(rename = "FIREWALL_BLACKLIST_VIOLATION")]
    Blacklist,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RecommendedAction {
    #[display("INSERT_FIREWALL_RULES")]
    #[serde(rename = "INSERT_FIREWALL_RULES")]
    InsertFirewallRules,
    #[display("DELETE_FIREWALL_RULES")]
    #[serde(rename = "DELETE_FIREWALL_RULES")]
    DeleteFirewallRules,
    #[display("UPDATE_FIREWALL_RULES")]
    #[serde(rename = "UPDATE_FIREWALL_RULES")]
    UpdateFirewallRules,
}

/// A single finding: which resource broke which rule, and what to do about it.
///
/// `recommended_actions` names the firewall rules to insert, delete or update: live rules
/// by name, missing policies as `"<rule id>: rule <index>"`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RuleViolation {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub full_name: Option<String>,
    pub rule_id: String,
    pub violation_type: ViolationType,
    pub policy_names: Vec<String>,
    pub recommended_actions: BTreeMap<RecommendedAction, Vec<String>>,
    pub resource_data: Vec<Value>,
}

impl RuleViolation {
    pub fn recommended(&self, action: RecommendedAction) -> &[String] {
        self.recommended_actions
            .get(&action)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
