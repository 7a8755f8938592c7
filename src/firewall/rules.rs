use super::actions::{ActionEntry, ActionKind, FirewallAction, FirewallActionError};
use super::config_files::FirewallRuleDefinition;
use super::network::{ips_in_list, NetworkError};
use super::records::FirewallRuleRecord;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

pub const INGRESS: &str = "INGRESS";
pub const EGRESS: &str = "EGRESS";

pub const DEFAULT_PRIORITY: i64 = 1000;

const MAX_NAME_LENGTH: usize = 63;
const MAX_LIST_ENTRIES: usize = 256;
const MAX_SERVICE_ACCOUNTS: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FirewallRuleError {
    #[error("invalid firewall rule: {0}")]
    InvalidRule(String),
    #[error(transparent)]
    InvalidAction(#[from] FirewallActionError),
    #[error(transparent)]
    InvalidNetwork(#[from] NetworkError),
}

fn invalid<T>(msg: impl Into<String>) -> Result<T, FirewallRuleError> {
    Err(FirewallRuleError::InvalidRule(msg.into()))
}

/// `inner` fits within `outer`. An empty `inner` doesn't restrict anything, so it always
/// fits; an empty `outer` only holds an empty `inner`.
fn within(inner: &BTreeSet<String>, outer: &BTreeSet<String>) -> bool {
    inner.is_subset(outer)
}

/// A firewall rule, either live (read from a cloud project) or one of the policies of a
/// policy rule.
///
/// Comparisons ignore identity fields (name, ids, priority): they are about the traffic
/// a rule lets through (or blocks).
#[derive(Clone, Debug)]
pub struct FirewallRule {
    project_id: Option<String>,
    resource_id: Option<String>,
    name: Option<String>,
    full_name: Option<String>,
    description: Option<String>,
    kind: Option<String>,
    network: Option<String>,
    priority: Option<String>,
    direction: Option<String>,
    source_ranges: BTreeSet<String>,
    destination_ranges: BTreeSet<String>,
    source_tags: BTreeSet<String>,
    target_tags: BTreeSet<String>,
    source_service_accounts: BTreeSet<String>,
    target_service_accounts: BTreeSet<String>,
    action: FirewallAction,
    disabled: Option<bool>,
    create_time: Option<String>,
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_json())
    }
}

impl FirewallRule {
    /// Builds a rule from an API-shaped definition, going through the storage
    /// transform
    pub fn from_definition(
        def: &FirewallRuleDefinition,
        project_id: Option<&str>,
        validate: bool,
    ) -> Result<Self, FirewallRuleError> {
        let record = FirewallRuleRecord::from_definition(def, project_id)
            .map_err(|e| FirewallRuleError::InvalidRule(e.to_string()))?;

        Self::from_record(&record, validate)
    }

    /// Builds a rule from its storage form
    pub fn from_record(record: &FirewallRuleRecord, validate: bool) -> Result<Self, FirewallRuleError> {
        let list = |field: &str, value: &Option<String>| -> Result<Vec<String>, FirewallRuleError> {
            match value {
                None => Ok(vec![]),
                Some(s) => serde_json::from_str::<Option<Vec<String>>>(s)
                    .map(Option::unwrap_or_default)
                    .map_err(|e| FirewallRuleError::InvalidRule(format!("cannot parse {}: {}", field, e))),
            }
        };

        let entries = |field: &str, value: &Option<String>| -> Result<Vec<Value>, FirewallRuleError> {
            match value {
                None => Ok(vec![]),
                Some(s) => serde_json::from_str::<Option<Vec<Value>>>(s)
                    .map(Option::unwrap_or_default)
                    .map_err(|e| FirewallRuleError::InvalidRule(format!("cannot parse {}: {}", field, e))),
            }
        };

        let mut builder = FirewallRuleBuilder::new()
            .source_ranges(list("sourceRanges", &record.firewall_rule_source_ranges)?)
            .destination_ranges(list("destinationRanges", &record.firewall_rule_destination_ranges)?)
            .source_tags(list("sourceTags", &record.firewall_rule_source_tags)?)
            .target_tags(list("targetTags", &record.firewall_rule_target_tags)?)
            .source_service_accounts(list(
                "sourceServiceAccounts",
                &record.firewall_rule_source_service_accounts,
            )?)
            .target_service_accounts(list(
                "targetServiceAccounts",
                &record.firewall_rule_target_service_accounts,
            )?)
            .allowed_values(entries("allowed", &record.firewall_rule_allowed)?)
            .denied_values(entries("denied", &record.firewall_rule_denied)?)
            .validate(validate);

        builder.project_id = record.project_id.clone();
        builder.resource_id = record.firewall_rule_id.clone();
        builder.name = record.firewall_rule_name.clone();
        builder.full_name = record.full_name.clone();
        builder.description = record.firewall_rule_description.clone();
        builder.kind = record.firewall_rule_kind.clone();
        builder.network = record.firewall_rule_network.clone();
        builder.priority = record.firewall_rule_priority.clone();
        builder.direction = record.firewall_rule_direction.clone();
        builder.disabled = record.firewall_rule_disabled;
        builder.create_time = record.firewall_rule_create_time.clone();

        builder.build()
    }

    /// Parses a rule from the JSON returned by the API
    pub fn from_json(json: &str, project_id: Option<&str>) -> Result<Self, FirewallRuleError> {
        let def: FirewallRuleDefinition = serde_json::from_str(json)
            .map_err(|e| FirewallRuleError::InvalidRule(format!("cannot parse rule json: {}", e)))?;

        Self::from_definition(&def, project_id, false)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn full_name(&self) -> Option<&str> {
        self.full_name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    /// Either [INGRESS] or [EGRESS] for a valid rule; upper-cased on construction
    pub fn direction(&self) -> Option<&str> {
        self.direction.as_deref()
    }

    /// The priority of the rule, 1000 when not set
    pub fn priority(&self) -> Result<i64, FirewallRuleError> {
        match self.priority {
            None => Ok(DEFAULT_PRIORITY),
            Some(ref p) => p.trim().parse::<i64>().map_err(|_| {
                FirewallRuleError::InvalidRule(format!(
                    "rule \"priority\" could not be converted to an integer: \"{}\"",
                    p
                ))
            }),
        }
    }

    pub fn source_ranges(&self) -> &BTreeSet<String> {
        &self.source_ranges
    }

    pub fn destination_ranges(&self) -> &BTreeSet<String> {
        &self.destination_ranges
    }

    pub fn source_tags(&self) -> &BTreeSet<String> {
        &self.source_tags
    }

    pub fn target_tags(&self) -> &BTreeSet<String> {
        &self.target_tags
    }

    pub fn source_service_accounts(&self) -> &BTreeSet<String> {
        &self.source_service_accounts
    }

    pub fn target_service_accounts(&self) -> &BTreeSet<String> {
        &self.target_service_accounts
    }

    pub fn firewall_action(&self) -> &FirewallAction {
        &self.action
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(false)
    }

    /// Checks that the rule could be submitted to the cloud API
    pub fn validate(&self) -> Result<(), FirewallRuleError> {
        self.validate_required_keys()?;
        self.validate_keys()?;
        self.validate_direction()?;
        self.validate_priority()?;
        self.action.validate()?;

        Ok(())
    }

    /// Checks a rule used as a policy template. Same as [FirewallRule::validate], except
    /// that name, network and direction may be left out.
    pub fn validate_template(&self) -> Result<(), FirewallRuleError> {
        self.validate_keys()?;
        if self.direction.is_some() {
            self.validate_direction()?;
        }
        self.validate_priority()?;
        self.action.validate()?;

        Ok(())
    }

    fn validate_required_keys(&self) -> Result<(), FirewallRuleError> {
        if self.name.as_deref().unwrap_or_default().is_empty() {
            return invalid("rule missing required field \"name\"");
        }

        if self.network.as_deref().unwrap_or_default().is_empty() {
            return invalid("rule missing required field \"network\"");
        }

        Ok(())
    }

    fn validate_keys(&self) -> Result<(), FirewallRuleError> {
        let name = self.name.as_deref().unwrap_or_default();

        if name.chars().count() > MAX_NAME_LENGTH {
            return invalid(format!(
                "rule name exceeds length limit of {} chars: \"{}\"",
                MAX_NAME_LENGTH, name
            ));
        }

        for (field, values) in [
            ("sourceRanges", &self.source_ranges),
            ("destinationRanges", &self.destination_ranges),
            ("sourceTags", &self.source_tags),
            ("targetTags", &self.target_tags),
        ] {
            if values.len() > MAX_LIST_ENTRIES {
                return invalid(format!(
                    "rule entry \"{}\" must contain {} or fewer values",
                    field, MAX_LIST_ENTRIES
                ));
            }
        }

        for (field, values) in [
            ("sourceServiceAccounts", &self.source_service_accounts),
            ("targetServiceAccounts", &self.target_service_accounts),
        ] {
            if values.len() > MAX_SERVICE_ACCOUNTS {
                return invalid(format!(
                    "rule entry \"{}\" may contain at most {} value",
                    field, MAX_SERVICE_ACCOUNTS
                ));
            }
        }

        let has_tags = !self.source_tags.is_empty() || !self.target_tags.is_empty();
        let has_service_accounts =
            !self.source_service_accounts.is_empty() || !self.target_service_accounts.is_empty();

        if has_tags && has_service_accounts {
            return invalid("tags and service accounts cannot be used together in the same rule");
        }

        Ok(())
    }

    fn validate_direction(&self) -> Result<(), FirewallRuleError> {
        match self.direction.as_deref() {
            Some(INGRESS) => {
                if self.source_ranges.is_empty()
                    && self.source_tags.is_empty()
                    && self.source_service_accounts.is_empty()
                {
                    return invalid(
                        "ingress rule missing required field oneof \"sourceRanges\", \"sourceTags\" or \"sourceServiceAccounts\"",
                    );
                }

                if !self.destination_ranges.is_empty() {
                    return invalid("ingress rules cannot include \"destinationRanges\"");
                }
            }
            Some(EGRESS) => {
                if self.destination_ranges.is_empty() {
                    return invalid("egress rule missing required field \"destinationRanges\"");
                }

                if !self.source_ranges.is_empty()
                    || !self.source_tags.is_empty()
                    || !self.source_service_accounts.is_empty()
                {
                    return invalid(
                        "egress rules cannot include \"sourceRanges\", \"sourceTags\" or \"sourceServiceAccounts\"",
                    );
                }
            }
            _ => return invalid("rule \"direction\" must be either \"INGRESS\" or \"EGRESS\""),
        }

        Ok(())
    }

    fn validate_priority(&self) -> Result<(), FirewallRuleError> {
        let priority = self.priority()?;

        if !(0..=65535).contains(&priority) {
            return invalid(format!("rule \"priority\" out of range 0-65535: \"{}\"", priority));
        }

        Ok(())
    }

    fn direction_compatible(&self, other: &FirewallRule) -> bool {
        self.direction.is_none() || other.direction.is_none() || self.direction == other.direction
    }

    fn network_compatible(&self, other: &FirewallRule) -> bool {
        other.network.is_none() || self.network == other.network
    }

    /// Checks if the traffic matched by this rule is also matched by `other`
    /// (`self < other`)
    pub fn is_subset_of(&self, other: &FirewallRule) -> Result<bool, FirewallRuleError> {
        Ok(self.direction_compatible(other)
            && self.network_compatible(other)
            && within(&self.source_tags, &other.source_tags)
            && within(&self.target_tags, &other.target_tags)
            && within(&self.source_service_accounts, &other.source_service_accounts)
            && within(&self.target_service_accounts, &other.target_service_accounts)
            && self.action.is_subset_of(&other.action)
            && ips_in_list(&self.source_ranges, &other.source_ranges)?
            && ips_in_list(&self.destination_ranges, &other.destination_ranges)?)
    }

    /// Checks if this rule matches all the traffic matched by `other` (`self > other`)
    pub fn is_superset_of(&self, other: &FirewallRule) -> Result<bool, FirewallRuleError> {
        Ok(self.direction_compatible(other)
            && self.network_compatible(other)
            && within(&other.source_tags, &self.source_tags)
            && within(&other.target_tags, &self.target_tags)
            && within(&other.source_service_accounts, &self.source_service_accounts)
            && within(&other.target_service_accounts, &self.target_service_accounts)
            && self.action.is_superset_of(&other.action)
            && ips_in_list(&other.source_ranges, &self.source_ranges)?
            && ips_in_list(&other.destination_ranges, &self.destination_ranges)?)
    }

    fn same_match_fields(&self, other: &FirewallRule) -> bool {
        self.direction == other.direction
            && self.network == other.network
            && self.source_tags == other.source_tags
            && self.target_tags == other.target_tags
            && self.source_ranges == other.source_ranges
            && self.destination_ranges == other.destination_ranges
            && self.source_service_accounts == other.source_service_accounts
            && self.target_service_accounts == other.target_service_accounts
    }

    /// Same match fields and an action which covers the same traffic, however the
    /// ports are written
    pub fn is_equivalent(&self, other: &FirewallRule) -> bool {
        self.same_match_fields(other) && self.action.is_equivalent(&other.action)
    }

    /// The rule in its API form
    pub fn as_json(&self) -> Value {
        let mut map = Map::new();

        let mut put = |key: &str, value: Value| {
            map.insert(key.to_string(), value);
        };

        if let Some(ref name) = self.name {
            put("name", Value::from(name.as_str()));
        }
        if let Some(ref description) = self.description {
            put("description", Value::from(description.as_str()));
        }
        if let Some(ref network) = self.network {
            put("network", Value::from(network.as_str()));
        }
        if let Ok(priority) = self.priority() {
            put("priority", Value::from(priority));
        }
        if let Some(ref direction) = self.direction {
            put("direction", Value::from(direction.as_str()));
        }

        for (key, values) in [
            ("sourceRanges", &self.source_ranges),
            ("destinationRanges", &self.destination_ranges),
            ("sourceTags", &self.source_tags),
            ("targetTags", &self.target_tags),
            ("sourceServiceAccounts", &self.source_service_accounts),
            ("targetServiceAccounts", &self.target_service_accounts),
        ] {
            if !values.is_empty() {
                put(key, Value::from(values.iter().cloned().collect::<Vec<_>>()));
            }
        }

        put(self.action.action().as_str(), self.action.json_value());

        if let Some(disabled) = self.disabled {
            put("disabled", Value::from(disabled));
        }
        if let Some(ref kind) = self.kind {
            put("kind", Value::from(kind.as_str()));
        }
        if let Some(ref create_time) = self.create_time {
            put("creationTimestamp", Value::from(create_time.as_str()));
        }

        Value::Object(map)
    }
}

/// Exact equality of the match fields and of the canonical action entries
impl PartialEq for FirewallRule {
    fn eq(&self, other: &Self) -> bool {
        self.same_match_fields(other) && self.action == other.action
    }
}

/// A builder for [FirewallRule] objects
#[derive(Clone, Debug, Default)]
pub struct FirewallRuleBuilder {
    project_id: Option<String>,
    resource_id: Option<String>,
    name: Option<String>,
    full_name: Option<String>,
    description: Option<String>,
    kind: Option<String>,
    network: Option<String>,
    priority: Option<String>,
    direction: Option<String>,
    source_ranges: Vec<String>,
    destination_ranges: Vec<String>,
    source_tags: Vec<String>,
    target_tags: Vec<String>,
    source_service_accounts: Vec<String>,
    target_service_accounts: Vec<String>,
    allowed: Vec<ActionEntry>,
    denied: Vec<ActionEntry>,
    allowed_values: Vec<Value>,
    denied_values: Vec<Value>,
    disabled: Option<bool>,
    create_time: Option<String>,
    validate: bool,
}

fn strings<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values.into_iter().map(|s| s.as_ref().to_string()).collect()
}

impl FirewallRuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project_id(self, project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            ..self
        }
    }

    pub fn name(self, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }

    pub fn full_name(self, full_name: &str) -> Self {
        Self {
            full_name: Some(full_name.to_string()),
            ..self
        }
    }

    pub fn network(self, network: &str) -> Self {
        Self {
            network: Some(network.to_string()),
            ..self
        }
    }

    pub fn priority(self, priority: i64) -> Self {
        Self {
            priority: Some(priority.to_string()),
            ..self
        }
    }

    pub fn direction(self, direction: &str) -> Self {
        Self {
            direction: Some(direction.to_string()),
            ..self
        }
    }

    pub fn source_ranges<I: IntoIterator<Item = S>, S: AsRef<str>>(self, ranges: I) -> Self {
        Self {
            source_ranges: strings(ranges),
            ..self
        }
    }

    pub fn destination_ranges<I: IntoIterator<Item = S>, S: AsRef<str>>(self, ranges: I) -> Self {
        Self {
            destination_ranges: strings(ranges),
            ..self
        }
    }

    pub fn source_tags<I: IntoIterator<Item = S>, S: AsRef<str>>(self, tags: I) -> Self {
        Self {
            source_tags: strings(tags),
            ..self
        }
    }

    pub fn target_tags<I: IntoIterator<Item = S>, S: AsRef<str>>(self, tags: I) -> Self {
        Self {
            target_tags: strings(tags),
            ..self
        }
    }

    pub fn source_service_accounts<I: IntoIterator<Item = S>, S: AsRef<str>>(self, accounts: I) -> Self {
        Self {
            source_service_accounts: strings(accounts),
            ..self
        }
    }

    pub fn target_service_accounts<I: IntoIterator<Item = S>, S: AsRef<str>>(self, accounts: I) -> Self {
        Self {
            target_service_accounts: strings(accounts),
            ..self
        }
    }

    /// Adds an `allowed` entry
    pub fn allow(self, entry: ActionEntry) -> Self {
        let mut allowed = self.allowed;
        allowed.push(entry);
        Self { allowed, ..self }
    }

    /// Adds a `denied` entry
    pub fn deny(self, entry: ActionEntry) -> Self {
        let mut denied = self.denied;
        denied.push(entry);
        Self { denied, ..self }
    }

    /// Raw `allowed` entries, as found in API responses
    pub fn allowed_values(self, values: Vec<Value>) -> Self {
        Self {
            allowed_values: values,
            ..self
        }
    }

    /// Raw `denied` entries, as found in API responses
    pub fn denied_values(self, values: Vec<Value>) -> Self {
        Self {
            denied_values: values,
            ..self
        }
    }

    /// Run [FirewallRule::validate] as part of [FirewallRuleBuilder::build]
    pub fn validate(self, validate: bool) -> Self {
        Self { validate, ..self }
    }

    fn action_entries(entries: Vec<ActionEntry>, values: &[Value]) -> Result<Vec<ActionEntry>, FirewallRuleError> {
        let mut entries = entries;
        for value in values.iter() {
            entries.push(ActionEntry::from_value(value)?);
        }
        Ok(entries)
    }

    pub fn build(self) -> Result<FirewallRule, FirewallRuleError> {
        let allowed = Self::action_entries(self.allowed, &self.allowed_values)?;
        let denied = Self::action_entries(self.denied, &self.denied_values)?;

        let action = match (allowed.is_empty(), denied.is_empty()) {
            (false, true) => FirewallAction::new(ActionKind::Allowed, allowed)?,
            (true, false) => FirewallAction::new(ActionKind::Denied, denied)?,
            (false, false) => {
                return invalid(format!(
                    "rule \"{}\" cannot have both allowed and denied entries",
                    self.name.as_deref().unwrap_or_default()
                ))
            }
            (true, true) => {
                return invalid(format!(
                    "rule \"{}\" is missing an allowed or denied action",
                    self.name.as_deref().unwrap_or_default()
                ))
            }
        };

        let rule = FirewallRule {
            project_id: self.project_id,
            resource_id: self.resource_id,
            name: self.name,
            full_name: self.full_name,
            description: self.description,
            kind: self.kind,
            network: self.network,
            priority: self.priority,
            direction: self.direction.map(|d| d.to_uppercase()),
            source_ranges: self.source_ranges.into_iter().collect(),
            destination_ranges: self.destination_ranges.into_iter().collect(),
            source_tags: self.source_tags.into_iter().collect(),
            target_tags: self.target_tags.into_iter().collect(),
            source_service_accounts: self.source_service_accounts.into_iter().collect(),
            target_service_accounts: self.target_service_accounts.into_iter().collect(),
            action,
            disabled: self.disabled,
            create_time: self.create_time,
        };

        if self.validate {
            rule.validate()?;
        }

        Ok(rule)
    }
}
