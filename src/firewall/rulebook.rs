//! Indexes the policy definitions and picks the rules in effect for a resource
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools;
use thiserror::Error;
use tracing::debug;

use super::ancestors::{AncestorResolver, HierarchicalNameResolver};
use super::config_files::{GroupDefinition, OrgResourceDefinition, RuleDefinition, RuleDefinitions};
use super::policies::Rule;
use super::resources::{Resource, ResourceError, ResourceKey, ResourceType};
use super::rules::{FirewallRule, FirewallRuleError};
use super::violations::RuleViolation;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum RuleBookError {
    #[error("rule {rule_id} (index {index}) is already defined")]
    DuplicateFirewallRule { rule_id: String, index: usize },
    #[error("rule group {0} is already defined")]
    DuplicateFirewallGroup(String),
    #[error("rule {0} doesn't exist")]
    RuleDoesntExist(String),
    #[error("rule group {0} doesn't exist")]
    GroupDoesntExist(String),
    #[error("invalid rule definition: {0}")]
    InvalidRuleDefinition(String),
    #[error("invalid rule group definition: {0}")]
    InvalidGroupDefinition(String),
    #[error("invalid org policy definition: {0}")]
    InvalidOrgDefinition(String),
    #[error("rule {rule_id} has an invalid policy: {source}")]
    InvalidPolicy {
        rule_id: String,
        source: FirewallRuleError,
    },
}

pub type Resolver = Arc<dyn AncestorResolver + Send + Sync>;

/// The policy rules, the rule groups and the org policy, indexed for evaluation
pub struct RuleBook {
    rules: IndexMap<String, Rule>,
    groups: IndexMap<String, Vec<String>>,
    org_policy: HashMap<ResourceKey, Vec<String>>,
    resolver: Resolver,
}

impl fmt::Debug for RuleBook {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RuleBook")
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .field("groups", &self.groups)
            .field("org_policy", &self.org_policy)
            .finish()
    }
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBook {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(HierarchicalNameResolver))
    }

    pub fn with_resolver(resolver: Resolver) -> Self {
        Self {
            rules: IndexMap::new(),
            groups: IndexMap::new(),
            org_policy: HashMap::new(),
            resolver,
        }
    }

    /// Builds a rule book out of the three sections of a policy file, in order: rules,
    /// groups, org policy. The first error aborts the build.
    pub fn build(defs: &RuleDefinitions, resolver: Resolver) -> Result<Self, RuleBookError> {
        let mut book = Self::with_resolver(resolver);

        book.add_rules(&defs.rules)?;
        book.add_rule_groups(&defs.rule_groups)?;
        book.add_org_policy(defs.org_policy.resources())?;

        debug!(target: "rulebook",
            "built rule book: {} rules, {} groups, {} org policy resources",
            book.rule_count(),
            book.group_count(),
            book.org_policy_count()
        );

        Ok(book)
    }

    pub fn add_rules(&mut self, defs: &[RuleDefinition]) -> Result<(), RuleBookError> {
        for (index, def) in defs.iter().enumerate() {
            if let Some(rule_id) = def.rule_id.as_deref().filter(|id| self.rules.contains_key(*id)) {
                return Err(RuleBookError::DuplicateFirewallRule {
                    rule_id: rule_id.to_string(),
                    index,
                });
            }

            let rule = Rule::from_config(def)?;

            debug!(target: "rulebook", "adding rule {} ({})", rule.id(), rule.mode());
            self.rules.insert(rule.id().to_string(), rule);
        }

        Ok(())
    }

    pub fn add_rule_groups(&mut self, defs: &[GroupDefinition]) -> Result<(), RuleBookError> {
        for def in defs.iter() {
            let Some(group_id) = def.group_id.as_deref().filter(|id| !id.is_empty()) else {
                return Err(RuleBookError::InvalidGroupDefinition(format!(
                    "group missing required field \"group_id\": {:?}",
                    def
                )));
            };

            if def.rule_ids.is_empty() {
                return Err(RuleBookError::InvalidGroupDefinition(format!(
                    "group {} has no rule_ids",
                    group_id
                )));
            }

            if self.groups.contains_key(group_id) {
                return Err(RuleBookError::DuplicateFirewallGroup(group_id.to_string()));
            }

            if let Some(missing) = def.rule_ids.iter().find(|id| !self.rules.contains_key(id.as_str())) {
                return Err(RuleBookError::RuleDoesntExist(missing.clone()));
            }

            debug!(target: "rulebook", "adding group {}: {}", group_id, def.rule_ids.iter().join(", "));
            self.groups.insert(group_id.to_string(), def.rule_ids.clone());
        }

        Ok(())
    }

    pub fn add_org_policy(&mut self, defs: &[OrgResourceDefinition]) -> Result<(), RuleBookError> {
        for def in defs.iter() {
            let resource_type = def
                .resource_type
                .as_deref()
                .ok_or_else(|| RuleBookError::InvalidOrgDefinition(format!("missing resource type: {:?}", def)))?;

            let resource_type = ResourceType::from_str(resource_type)
                .map_err(|e| RuleBookError::InvalidOrgDefinition(e.to_string()))?;

            if def.resource_ids.is_empty() {
                return Err(RuleBookError::InvalidOrgDefinition(format!(
                    "{} entry has no resource_ids",
                    resource_type
                )));
            }

            let rule_ids = self.resolve_rule_ids(def)?;

            for resource_id in def.resource_ids.iter() {
                let key = ResourceKey::new(resource_type, resource_id);

                debug!(target: "rulebook",
                    "org policy {}/{}: {}",
                    resource_type,
                    resource_id,
                    rule_ids.iter().join(", ")
                );

                let merged = match self.org_policy.remove(&key) {
                    Some(existing) => self.ordered(existing.iter().chain(rule_ids.iter()))?,
                    None => rule_ids.clone(),
                };

                self.org_policy.insert(key, merged);
            }
        }

        Ok(())
    }

    /// Direct rule ids plus the ones reached through groups, in rule definition order
    fn resolve_rule_ids(&self, def: &OrgResourceDefinition) -> Result<Vec<String>, RuleBookError> {
        let mut ids: Vec<&String> = vec![];

        for group_id in def.rules.group_ids.iter() {
            let group = self
                .groups
                .get(group_id)
                .ok_or_else(|| RuleBookError::GroupDoesntExist(group_id.clone()))?;
            ids.extend(group.iter());
        }

        ids.extend(def.rules.rule_ids.iter());

        self.ordered(ids.into_iter())
    }

    fn ordered<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Result<Vec<String>, RuleBookError> {
        let mut indexes = BTreeSet::new();

        for id in ids {
            let index = self
                .rules
                .get_index_of(id)
                .ok_or_else(|| RuleBookError::RuleDoesntExist(id.clone()))?;
            indexes.insert(index);
        }

        Ok(indexes
            .into_iter()
            .filter_map(|i| self.rules.get_index(i).map(|(id, _)| id.clone()))
            .collect())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn org_policy_count(&self) -> usize {
        self.org_policy.len()
    }

    pub fn rule(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.get(rule_id)
    }

    pub fn group(&self, group_id: &str) -> Option<&[String]> {
        self.groups.get(group_id).map(Vec::as_slice)
    }

    /// Rule ids attached directly to a resource
    pub fn rules_for(&self, key: &ResourceKey) -> Option<&[String]> {
        self.org_policy.get(key).map(Vec::as_slice)
    }

    /// Evaluates the live firewall rules of `resource` against the rules of its closest
    /// ancestor (itself included) which has rules attached
    pub fn find_violations(
        &self,
        resource: &Resource,
        policies: &[FirewallRule],
    ) -> Result<Vec<RuleViolation>, ResourceError> {
        let chain = match resource.full_name.as_deref() {
            Some(full_name) => self.resolver.find_ancestors(resource, full_name)?,
            None => vec![resource.clone()],
        };

        let Some((ancestor, rule_ids)) = chain
            .iter()
            .find_map(|ancestor| self.org_policy.get(&ancestor.key()).map(|ids| (ancestor, ids)))
        else {
            debug!(target: "rulebook", "no rules apply to {}/{}", resource.resource_type, resource.id);
            return Ok(vec![]);
        };

        debug!(target: "rulebook",
            "evaluating {}/{} with the rules of {}/{}: {}",
            resource.resource_type,
            resource.id,
            ancestor.resource_type,
            ancestor.id,
            rule_ids.iter().join(", ")
        );

        Ok(rule_ids
            .iter()
            .filter_map(|id| self.rules.get(id))
            .flat_map(|rule| rule.find_policy_violations(resource, policies))
            .collect())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::firewall::testing::{definitions, live_rule, project};
    use crate::firewall::violations::ViolationType;
    use anyhow::Result;
    use assert2::check;
    use rstest::rstest;

    const RULES: &str = r#"
rules:
  - rule_id: r1
    mode: required
    match_policies:
      - sourceRanges: ["10.0.0.0/8"]
        allowed: [{IPProtocol: tcp, ports: ["22"]}]
  - rule_id: r2
    mode: whitelist
    match_policies:
      - allowed: ["*"]
    verify_policies:
      - allowed: [{IPProtocol: tcp, ports: ["1-1024"]}]
  - rule_id: r3
    mode: blacklist
    match_policies:
      - allowed: ["*"]
    verify_policies:
      - sourceRanges: ["0.0.0.0/0"]
        allowed: [{IPProtocol: tcp, ports: ["22"]}]
"#;

    fn book(extra: &str) -> Result<RuleBook> {
        let defs = RuleDefinitions::from_yaml(&format!("{}{}", RULES, extra))?;
        Ok(RuleBook::build(&defs, Arc::new(HierarchicalNameResolver))?)
    }

    #[test]
    fn test_build() -> Result<()> {
        let book = book(
            r#"
rule_groups:
  - group_id: g1
    rule_ids: [r3, r2]
org_policy:
  - type: organization
    resource_ids: [1]
    rules:
      group_ids: [g1]
      rule_ids: [r1, r2]
"#,
        )?;

        check!(book.rule_count() == 3);
        check!(book.group("g1") == Some(&["r3".to_string(), "r2".to_string()][..]));

        // ordered by definition, duplicates removed
        let key = ResourceKey::new(ResourceType::Organization, "1");
        check!(book.rules_for(&key) == Some(&["r1".to_string(), "r2".to_string(), "r3".to_string()][..]));
        Ok(())
    }

    #[rstest]
    #[case::same_body("match_policies: [{sourceRanges: [10.0.0.0/8], allowed: [{IPProtocol: tcp, ports: ['22']}]}]")]
    #[case::other_body("match_policies: [{allowed: [{IPProtocol: udp, ports: ['53']}]}]")]
    // the id clash is reported before the body is looked at
    #[case::invalid_body("match_policies: [{allowed: ['*']}]")]
    fn test_duplicate_rule(#[case] body: &str) -> Result<()> {
        let defs = RuleDefinitions::from_yaml(&format!(
            "{}  - rule_id: r1\n    mode: required\n    {}\n",
            RULES, body
        ))?;

        let res = RuleBook::build(&defs, Arc::new(HierarchicalNameResolver));
        check!(
            res.err()
                == Some(RuleBookError::DuplicateFirewallRule {
                    rule_id: "r1".to_string(),
                    index: 3
                })
        );
        Ok(())
    }

    #[rstest]
    #[case::unknown_rule("rule_groups:\n  - group_id: g1\n    rule_ids: [r9]\n", RuleBookError::RuleDoesntExist("r9".to_string()))]
    #[case::duplicate_group(
        "rule_groups:\n  - group_id: g1\n    rule_ids: [r1]\n  - group_id: g1\n    rule_ids: [r2]\n",
        RuleBookError::DuplicateFirewallGroup("g1".to_string())
    )]
    #[case::unknown_group(
        "org_policy:\n  - type: project\n    resource_ids: [p1]\n    rules:\n      group_ids: [g9]\n",
        RuleBookError::GroupDoesntExist("g9".to_string())
    )]
    #[case::unknown_org_rule(
        "org_policy:\n  - type: project\n    resource_ids: [p1]\n    rules:\n      rule_ids: [r9]\n",
        RuleBookError::RuleDoesntExist("r9".to_string())
    )]
    fn test_definition_errors(#[case] extra: &str, #[case] expected: RuleBookError) {
        let res = book(extra);
        check!(let Err(_) = &res);

        if let Err(e) = res {
            check!(e.downcast_ref::<RuleBookError>() == Some(&expected));
        }
    }

    #[rstest]
    #[case::empty_group_id("rule_groups:\n  - rule_ids: [r1]\n")]
    #[case::empty_group("rule_groups:\n  - group_id: g1\n")]
    fn test_invalid_groups(#[case] extra: &str) {
        let res = book(extra);
        check!(let Err(_) = &res);

        if let Err(e) = res {
            check!(let Some(RuleBookError::InvalidGroupDefinition(_)) = e.downcast_ref::<RuleBookError>());
        }
    }

    #[rstest]
    #[case::no_resources("org_policy:\n  - type: project\n    rules:\n      rule_ids: [r1]\n")]
    #[case::unknown_type("org_policy:\n  - type: bucket\n    resource_ids: [b]\n")]
    #[case::missing_type("org_policy:\n  - resource_ids: [b]\n")]
    fn test_invalid_org_policy(#[case] extra: &str) {
        let res = book(extra);
        check!(let Err(_) = &res);

        if let Err(e) = res {
            check!(let Some(RuleBookError::InvalidOrgDefinition(_)) = e.downcast_ref::<RuleBookError>());
        }
    }

    #[rstest]
    fn test_closest_ancestor_wins(project: Resource) -> Result<()> {
        // the folder enforces r1 and r3, the project overrides it with r2
        let book = book(
            r#"
org_policy:
  - type: folder
    resource_ids: [2]
    rules:
      rule_ids: [r1, r3]
  - type: project
    resource_ids: [my-project]
    rules:
      rule_ids: [r2]
"#,
        )?;

        let project = project.with_full_name("organization/1/folder/2/project/my-project/");
        let world_ssh = live_rule("world-ssh", &["0.0.0.0/0"], &["22"])?;
        let high = live_rule("high", &["0.0.0.0/0"], &["8080"])?;

        let violations = book.find_violations(&project, &[world_ssh.clone(), high.clone()])?;
        check!(violations.len() == 1);
        check!(violations[0].rule_id == "r2");
        check!(violations[0].policy_names == ["high"]);

        // a sibling project only gets the folder rules
        let sibling = Resource::new(ResourceType::Project, "sibling")
            .with_full_name("organization/1/folder/2/project/sibling/");
        let violations = book.find_violations(&sibling, &[world_ssh, high])?;

        let found = violations.iter().map(|v| (v.rule_id.as_str(), v.violation_type)).collect::<Vec<_>>();
        check!(found == vec![("r1", ViolationType::Required), ("r3", ViolationType::Blacklist)]);
        Ok(())
    }

    #[rstest]
    fn test_no_rules_in_effect(project: Resource) -> Result<()> {
        let book = book("org_policy:\n  - type: project\n    resource_ids: [other]\n    rules:\n      rule_ids: [r1]\n")?;

        check!(book.find_violations(&project, &[])?.is_empty());

        // without a full name only the resource itself is looked up
        let bare = Resource::new(ResourceType::Project, "other");
        check!(book.find_violations(&bare, &[])?.len() == 1);
        Ok(())
    }

    #[rstest]
    fn test_malformed_full_name(project: Resource) -> Result<()> {
        let book = book("")?;
        let project = project.with_full_name("organization");

        check!(let Err(ResourceError::InvalidFullName { .. }) = book.find_violations(&project, &[]));
        Ok(())
    }

    #[rstest]
    fn test_resource_file(definitions: RuleDefinitions) -> Result<()> {
        let book = RuleBook::build(&definitions, Arc::new(HierarchicalNameResolver))?;

        check!(book.rule_count() == 5);
        check!(book.group_count() == 1);
        check!(book.org_policy_count() == 4);
        Ok(())
    }
}
