use super::config_files::{FirewallRuleDefinition, RuleDefinition};
use super::resources::{Resource, ResourceType};
use super::rulebook::RuleBookError;
use super::rules::{FirewallRule, FirewallRuleError};
use super::violations::{RecommendedAction, RuleViolation, ViolationType};
use anyhow::anyhow;
use derive_more::Display;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tracing::{debug, warn};

/// How a policy rule is enforced on the live firewall rules of a resource
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RuleMode {
    /// Live rules matching the policy family must fit within one of the verify policies
    #[display("whitelist")]
    Whitelist,
    /// Live rules matching the policy family must not cover any of the verify policies
    #[display("blacklist")]
    Blacklist,
    /// Every match policy must exist among the live rules
    #[display("required")]
    Required,
    /// The live rules must be exactly the match policies
    #[display("matches")]
    Matches,
}

impl FromStr for RuleMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "whitelist" => Ok(RuleMode::Whitelist),
            "blacklist" => Ok(RuleMode::Blacklist),
            "required" => Ok(RuleMode::Required),
            "matches" => Ok(RuleMode::Matches),
            _ => Err(anyhow!("unknown rule mode: {}", s)),
        }
    }
}

/// A policy rule of the rule book
#[derive(Clone, Debug)]
pub struct Rule {
    id: String,
    mode: RuleMode,
    match_rules: Vec<FirewallRule>,
    verify_rules: Vec<FirewallRule>,
    exact_match: bool,
}

fn compile_policies(
    rule_id: &str,
    definitions: &[FirewallRuleDefinition],
    validate: bool,
) -> Result<Vec<FirewallRule>, RuleBookError> {
    definitions
        .iter()
        .map(|def| -> Result<FirewallRule, FirewallRuleError> {
            let rule = FirewallRule::from_definition(def, None, false)?;
            if validate {
                rule.validate_template()?;
            }
            Ok(rule)
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| RuleBookError::InvalidPolicy {
            rule_id: rule_id.to_string(),
            source,
        })
}

impl Rule {
    pub fn new(
        id: &str,
        mode: RuleMode,
        match_rules: Vec<FirewallRule>,
        verify_rules: Vec<FirewallRule>,
        exact_match: bool,
    ) -> Self {
        Self {
            id: id.to_string(),
            mode,
            match_rules,
            verify_rules,
            exact_match,
        }
    }

    /// Compiles a rule from its definition in the policy file
    pub fn from_config(def: &RuleDefinition) -> Result<Self, RuleBookError> {
        let Some(id) = def.rule_id.as_deref().filter(|id| !id.is_empty()) else {
            return Err(RuleBookError::InvalidRuleDefinition(format!(
                "rule missing required field \"rule_id\": {:?}",
                def
            )));
        };

        let mode = def
            .mode
            .as_deref()
            .ok_or_else(|| RuleBookError::InvalidRuleDefinition(format!("rule {} is missing a mode", id)))?;

        let mode = RuleMode::from_str(mode)
            .map_err(|e| RuleBookError::InvalidRuleDefinition(format!("rule {}: {}", id, e)))?;

        match mode {
            RuleMode::Whitelist | RuleMode::Blacklist => {
                if def.match_policies.is_empty() || def.verify_policies.is_empty() {
                    return Err(RuleBookError::InvalidRuleDefinition(format!(
                        "{} rule {} needs both match_policies and verify_policies",
                        mode, id
                    )));
                }
            }
            RuleMode::Required | RuleMode::Matches => {
                if def.match_policies.is_empty() {
                    return Err(RuleBookError::InvalidRuleDefinition(format!(
                        "{} rule {} needs match_policies",
                        mode, id
                    )));
                }

                if !def.verify_policies.is_empty() {
                    return Err(RuleBookError::InvalidRuleDefinition(format!(
                        "{} rule {} cannot have verify_policies",
                        mode, id
                    )));
                }
            }
        }

        let validate = matches!(mode, RuleMode::Required | RuleMode::Matches);

        let match_rules = compile_policies(id, &def.match_policies, validate)?;
        let verify_rules = compile_policies(id, &def.verify_policies, false)?;

        debug!(target: "policies",
            "compiled rule {} ({}): {} match, {} verify policies",
            id,
            mode,
            match_rules.len(),
            verify_rules.len()
        );

        Ok(Self::new(
            id,
            mode,
            match_rules,
            verify_rules,
            def.exact_match.unwrap_or(true),
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> RuleMode {
        self.mode
    }

    pub fn match_rules(&self) -> &[FirewallRule] {
        &self.match_rules
    }

    pub fn verify_rules(&self) -> &[FirewallRule] {
        &self.verify_rules
    }

    pub fn exact_match(&self) -> bool {
        self.exact_match
    }

    /// Evaluates the live firewall rules of `resource`
    pub fn find_policy_violations(&self, resource: &Resource, policies: &[FirewallRule]) -> Vec<RuleViolation> {
        match self.mode {
            RuleMode::Matches => self.matches_violations(resource, policies),
            RuleMode::Required => self.required_violations(resource, policies),
            RuleMode::Whitelist => {
                self.family_violations(resource, policies, ViolationType::Whitelist, is_whitelist_violation)
            }
            RuleMode::Blacklist => {
                self.family_violations(resource, policies, ViolationType::Blacklist, is_blacklist_violation)
            }
        }
    }

    fn label(&self, index: usize) -> String {
        format!("{}: rule {}", self.id, index)
    }

    fn matches_violations(&self, resource: &Resource, policies: &[FirewallRule]) -> Vec<RuleViolation> {
        let mut inserts: BTreeSet<String> = self
            .match_rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| is_rule_exists_violation(rule, policies, self.exact_match))
            .map(|(i, _)| self.label(i))
            .collect();

        let mut deletes: BTreeSet<String> = policies
            .iter()
            .filter(|policy| is_rule_exists_violation(policy, &self.match_rules, self.exact_match))
            .map(|policy| policy.name().unwrap_or_default().to_string())
            .collect();

        let updates: BTreeSet<String> = inserts.intersection(&deletes).cloned().collect();

        inserts.retain(|i| !updates.contains(i));
        deletes.retain(|d| !updates.contains(d));

        if inserts.is_empty() && deletes.is_empty() && updates.is_empty() {
            return vec![];
        }

        let actions: BTreeMap<RecommendedAction, Vec<String>> = BTreeMap::from([
            (RecommendedAction::InsertFirewallRules, inserts.into_iter().collect()),
            (RecommendedAction::DeleteFirewallRules, deletes.into_iter().collect()),
            (RecommendedAction::UpdateFirewallRules, updates.into_iter().collect()),
        ]);

        vec![self.violation(resource, policies, ViolationType::Matches, actions)]
    }

    fn required_violations(&self, resource: &Resource, policies: &[FirewallRule]) -> Vec<RuleViolation> {
        self.match_rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| is_rule_exists_violation(rule, policies, self.exact_match))
            .map(|(i, _)| {
                let actions = BTreeMap::from([(RecommendedAction::InsertFirewallRules, vec![self.label(i)])]);
                self.violation(resource, policies, ViolationType::Required, actions)
            })
            .collect()
    }

    /// Whitelist and blacklist modes: only the live rules covering one of the match
    /// policies are checked against the verify policies
    fn family_violations(
        &self,
        resource: &Resource,
        policies: &[FirewallRule],
        violation_type: ViolationType,
        is_violation: fn(&[FirewallRule], &FirewallRule) -> Result<bool, FirewallRuleError>,
    ) -> Vec<RuleViolation> {
        let mut violations = vec![];

        for policy in policies.iter() {
            let outcome = self.in_family(policy).and_then(|in_family| {
                if !in_family {
                    return Ok(false);
                }
                is_violation(&self.verify_rules, policy)
            });

            match outcome {
                Ok(true) => {
                    let actions = BTreeMap::from([(
                        RecommendedAction::DeleteFirewallRules,
                        vec![policy.name().unwrap_or_default().to_string()],
                    )]);
                    violations.push(self.violation(
                        resource,
                        std::slice::from_ref(policy),
                        violation_type,
                        actions,
                    ));
                }
                Ok(false) => {}
                Err(e) => warn!(target: "policies",
                    "rule {}: skipping firewall rule {}: {}",
                    self.id,
                    policy.name().unwrap_or_default(),
                    e
                ),
            }
        }

        violations
    }

    fn in_family(&self, policy: &FirewallRule) -> Result<bool, FirewallRuleError> {
        for rule in self.match_rules.iter() {
            if policy.is_superset_of(rule)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn violation(
        &self,
        resource: &Resource,
        policies: &[FirewallRule],
        violation_type: ViolationType,
        recommended_actions: BTreeMap<RecommendedAction, Vec<String>>,
    ) -> RuleViolation {
        let first = policies.first();

        let mut policy_names = policies
            .iter()
            .map(|p| p.name().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        policy_names.sort();

        RuleViolation {
            resource_type: ResourceType::FirewallRule,
            resource_id: first
                .and_then(|p| p.project_id())
                .unwrap_or(resource.id.as_str())
                .to_string(),
            full_name: first.and_then(|p| p.full_name()).map(str::to_string),
            rule_id: self.id.clone(),
            violation_type,
            policy_names,
            recommended_actions,
            resource_data: policies.iter().map(|p| p.as_json()).collect(),
        }
    }
}

/// True when no rule of `policies` is the same as `rule`: equal when `exact_match` is
/// set, equivalent otherwise
pub fn is_rule_exists_violation(rule: &FirewallRule, policies: &[FirewallRule], exact_match: bool) -> bool {
    if exact_match {
        !policies.iter().any(|p| p == rule)
    } else {
        !policies.iter().any(|p| p.is_equivalent(rule))
    }
}

/// True when `policy` doesn't fit within any of `rules`
pub fn is_whitelist_violation(rules: &[FirewallRule], policy: &FirewallRule) -> Result<bool, FirewallRuleError> {
    for rule in rules.iter() {
        if policy.is_subset_of(rule)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// True when `policy` covers one of `rules`
pub fn is_blacklist_violation(rules: &[FirewallRule], policy: &FirewallRule) -> Result<bool, FirewallRuleError> {
    for rule in rules.iter() {
        if policy.is_superset_of(rule)? {
            return Ok(true);
        }
    }
    Ok(false)
}
