//! Structures used for decoding policy definitions and firewall rules read from files
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

use anyhow::{Context, Result};

/// A scalar that may be written either as a string or as a number (ids, priorities)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Integer(i64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scalar::Integer(i) => write!(f, "{}", i),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Deserializes an id written either as a string or as a number
pub fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Scalar::deserialize(deserializer)?.to_string())
}

fn scalar_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let items: Option<Vec<Scalar>> = Option::deserialize(deserializer)?;

    Ok(items
        .unwrap_or_default()
        .iter()
        .map(|s| s.to_string())
        .collect())
}

/// A firewall rule as returned by the cloud API, or as written in the `match_policies`
/// and `verify_policies` of a policy rule.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRuleDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ranges: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ranges: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service_accounts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service_accounts: Option<Vec<String>>,
    /// Raw entries; either `{IPProtocol, ports}` mappings or the `"*"` sentinel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

/// A policy rule (`rules` section)
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// One of whitelist, blacklist, required, matches
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub match_policies: Vec<FirewallRuleDefinition>,
    #[serde(default)]
    pub verify_policies: Vec<FirewallRuleDefinition>,
    #[serde(default)]
    pub exact_match: Option<bool>,
}

/// A named set of rules (`rule_groups` section)
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GroupDefinition {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub rule_ids: Vec<String>,
}

/// Rules applied to the resources of an org policy entry
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OrgRulesDefinition {
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub rule_ids: Vec<String>,
}

/// An entry of the `org_policy` section: resources of one type and the rules
/// enforced on them
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OrgResourceDefinition {
    #[serde(default, rename = "type")]
    pub resource_type: Option<String>,
    #[serde(default, deserialize_with = "scalar_list")]
    pub resource_ids: Vec<String>,
    #[serde(default)]
    pub rules: OrgRulesDefinition,
}

/// The `org_policy` section, written either as a plain list of resource entries or as a
/// mapping holding them under `resources`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OrgPolicyDefinition {
    List(Vec<OrgResourceDefinition>),
    Mapping {
        #[serde(default)]
        resources: Vec<OrgResourceDefinition>,
    },
}

impl Default for OrgPolicyDefinition {
    fn default() -> Self {
        OrgPolicyDefinition::List(vec![])
    }
}

impl OrgPolicyDefinition {
    pub fn resources(&self) -> &[OrgResourceDefinition] {
        match self {
            OrgPolicyDefinition::List(resources) => resources,
            OrgPolicyDefinition::Mapping { resources } => resources,
        }
    }
}

/// A complete policy definition file
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RuleDefinitions {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(default)]
    pub rule_groups: Vec<GroupDefinition>,
    #[serde(default)]
    pub org_policy: OrgPolicyDefinition,
}

impl RuleDefinitions {
    /// Loads a policy definition file. JSON files are accepted too, being valid YAML.
    pub fn load(path: &Path) -> Result<RuleDefinitions> {
        info!("loading rule definitions: {}", path.display());

        let data = fs::read_to_string(path)
            .with_context(|| format!("cannot read rule definitions from {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("cannot parse {}", path.display()))
    }

    pub fn from_yaml(data: &str) -> Result<RuleDefinitions> {
        // an empty document means no rules at all
        if data.trim().is_empty() {
            return Ok(RuleDefinitions::default());
        }

        Ok(serde_yaml::from_str(data)?)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::firewall::testing::test_dir;
    use assert2::{assert, check};
    use rstest::rstest;
    use serde_json::json;
    use std::path::PathBuf;

    #[rstest]
    fn test_load_definitions(test_dir: PathBuf) -> Result<()> {
        let defs = RuleDefinitions::load(&test_dir.join("rules.yaml"))?;

        check!(defs.rules.len() == 5);
        check!(defs.rule_groups.len() == 1);
        check!(defs.org_policy.resources().len() == 3);

        let rule = &defs.rules[0];
        check!(rule.rule_id.as_deref() == Some("golden_policy"));
        check!(rule.mode.as_deref() == Some("matches"));
        check!(rule.match_policies.len() == 1);
        check!(rule.match_policies[0].source_ranges == Some(vec!["0.0.0.0/0".to_string()]));

        // numeric ids get turned into strings
        let org = &defs.org_policy.resources()[0];
        check!(org.resource_type.as_deref() == Some("organization"));
        check!(org.resource_ids == vec!["1234567890".to_string(), "1".to_string()]);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let res = RuleDefinitions::load(Path::new("/nonexistent/rules.yaml"));
        assert!(let Err(_) = res);
    }

    #[test]
    fn test_empty_sections_default() -> Result<()> {
        let defs = RuleDefinitions::from_yaml("")?;
        check!(defs.rules.is_empty());
        check!(defs.rule_groups.is_empty());
        check!(defs.org_policy.resources().is_empty());

        let defs = RuleDefinitions::from_yaml("rules: []\n")?;
        check!(defs.org_policy.resources().is_empty());
        Ok(())
    }

    #[test]
    fn test_org_policy_layouts() -> Result<()> {
        let as_list = RuleDefinitions::from_yaml(
            r#"
org_policy:
  - type: project
    resource_ids: [p1, p2]
    rules:
      rule_ids: [r1]
"#,
        )?;
        check!(as_list.org_policy.resources().len() == 1);
        check!(as_list.org_policy.resources()[0].resource_ids == vec!["p1", "p2"]);

        let as_mapping = RuleDefinitions::from_yaml(
            r#"
org_policy:
  resources:
    - type: folder
      resource_ids: [12]
      rules:
        group_ids: [g1]
"#,
        )?;
        let resources = as_mapping.org_policy.resources();
        check!(resources.len() == 1);
        check!(resources[0].resource_ids == vec!["12"]);
        check!(resources[0].rules.group_ids == vec!["g1"]);
        Ok(())
    }

    #[test]
    fn test_firewall_rule_definition_fields() -> Result<()> {
        let def: FirewallRuleDefinition = serde_json::from_value(json!({
            "id": "12345",
            "name": "allow-ssh",
            "network": "https://www.googleapis.com/compute/v1/projects/p/global/networks/default",
            "priority": 900,
            "direction": "INGRESS",
            "sourceRanges": ["10.0.0.0/8"],
            "targetServiceAccounts": ["sa@p.iam.gserviceaccount.com"],
            "allowed": [{"IPProtocol": "tcp", "ports": ["22"]}],
            "creationTimestamp": "2018-01-01T00:00:00.000-07:00",
            "selfLink": "ignored"
        }))?;

        check!(def.id == Some(Scalar::Text("12345".to_string())));
        check!(def.priority == Some(Scalar::Integer(900)));
        check!(def.target_service_accounts.as_ref().map(|s| s.len()) == Some(1));
        check!(def.allowed.as_ref().map(|a| a.len()) == Some(1));
        check!(def.denied.is_none());
        Ok(())
    }
}
