use super::ports::{parse_port_token, PortError, PortSpec};
use anyhow::anyhow;
use itertools::Itertools;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The match-any sentinel which can replace the list of protocol entries
pub const MATCH_ANY: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FirewallActionError {
    #[error("invalid firewall action: {0}")]
    InvalidAction(String),
    #[error("invalid firewall action: {0}")]
    InvalidPort(#[from] PortError),
}

/// Whether the traffic described by a firewall action is allowed or denied
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Allowed,
    Denied,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match &self {
            ActionKind::Allowed => "allowed",
            ActionKind::Denied => "denied",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(ActionKind::Allowed),
            "denied" => Ok(ActionKind::Denied),
            _ => Err(anyhow!("firewall rule action must be either allowed or denied, got: {}", s)),
        }
    }
}

/// One element of the `allowed`/`denied` list of a firewall rule
#[derive(Clone, Debug, PartialEq)]
pub enum ActionEntry {
    /// The `"*"` sentinel
    Any,
    Protocol {
        protocol: Option<String>,
        ports: Option<Vec<String>>,
        /// Keys other than `IPProtocol` and `ports`; only kept so validation can reject them
        extra: BTreeMap<String, Value>,
    },
}

impl ActionEntry {
    /// Shorthand for a `{IPProtocol, ports}` entry
    pub fn protocol<S: AsRef<str>>(protocol: &str, ports: &[S]) -> Self {
        ActionEntry::Protocol {
            protocol: Some(protocol.to_string()),
            ports: if ports.is_empty() {
                None
            } else {
                Some(ports.iter().map(|p| p.as_ref().to_string()).collect())
            },
            extra: BTreeMap::new(),
        }
    }

    /// Converts an entry as found in API responses and policy files
    pub fn from_value(value: &Value) -> Result<Self, FirewallActionError> {
        match value {
            Value::String(s) if s == MATCH_ANY => Ok(ActionEntry::Any),
            Value::Object(map) => {
                let mut protocol = None;
                let mut ports = None;
                let mut extra = BTreeMap::new();

                for (key, v) in map.iter() {
                    match key.as_str() {
                        "IPProtocol" => protocol = Some(scalar_to_string(v)?),
                        "ports" => match v {
                            Value::Array(items) => {
                                ports = Some(
                                    items
                                        .iter()
                                        .map(scalar_to_string)
                                        .collect::<Result<Vec<_>, _>>()?,
                                );
                            }
                            _ => {
                                return Err(FirewallActionError::InvalidAction(format!(
                                    "ports must be a list, got: {}",
                                    v
                                )))
                            }
                        },
                        _ => {
                            extra.insert(key.clone(), v.clone());
                        }
                    }
                }

                Ok(ActionEntry::Protocol {
                    protocol,
                    ports,
                    extra,
                })
            }
            _ => Err(FirewallActionError::InvalidAction(format!(
                "unexpected action entry: {}",
                value
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ActionEntry::Any => Value::String(MATCH_ANY.to_string()),
            ActionEntry::Protocol {
                protocol,
                ports,
                extra,
            } => {
                let mut map = Map::new();
                if let Some(p) = protocol {
                    map.insert("IPProtocol".to_string(), Value::from(p.as_str()));
                }
                if let Some(ports) = ports {
                    map.insert("ports".to_string(), Value::from(ports.clone()));
                }
                for (k, v) in extra.iter() {
                    map.insert(k.clone(), v.clone());
                }
                Value::Object(map)
            }
        }
    }

    fn protocol_name(&self) -> Option<&str> {
        match self {
            ActionEntry::Any => None,
            ActionEntry::Protocol { protocol, .. } => protocol.as_deref(),
        }
    }
}

fn scalar_to_string(v: &Value) -> Result<String, FirewallActionError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(FirewallActionError::InvalidAction(format!(
            "expected a string or a number, got: {}",
            v
        ))),
    }
}

/// Sort key for a port token: the (start of the) port number. Tokens which don't parse
/// sort last and keep their relative order.
fn port_sort_key(token: &str) -> u32 {
    token
        .split('-')
        .next()
        .and_then(|start| start.trim().parse::<u32>().ok())
        .unwrap_or(u32::MAX)
}

/// Sorts entries by protocol and the ports of each entry numerically. A list holding
/// the match-any sentinel is returned as is.
fn sort_entries(mut entries: Vec<ActionEntry>) -> Vec<ActionEntry> {
    if entries.iter().any(|e| *e == ActionEntry::Any) {
        return entries;
    }

    entries.sort_by(|a, b| {
        a.protocol_name()
            .unwrap_or_default()
            .cmp(b.protocol_name().unwrap_or_default())
    });

    for entry in entries.iter_mut() {
        if let ActionEntry::Protocol {
            ports: Some(ports), ..
        } = entry
        {
            ports.sort_by_key(|p| port_sort_key(p));
        }
    }

    entries
}

/// The allow/deny part of a firewall rule: a list of (protocol, ports) entries
#[derive(Clone, Debug)]
pub struct FirewallAction {
    action: ActionKind,
    rules: Vec<ActionEntry>,

    any_value: bool,
    applies_to_all: bool,
    expanded_rules: BTreeMap<String, PortSpec>,
}

impl FirewallAction {
    pub fn new(action: ActionKind, rules: Vec<ActionEntry>) -> Result<Self, FirewallActionError> {
        let rules = sort_entries(rules);

        let any_value = !rules.is_empty() && rules.iter().all(|r| *r == ActionEntry::Any);
        let applies_to_all = rules.iter().any(|r| r.protocol_name() == Some("all"));

        let mut expanded_rules: BTreeMap<String, PortSpec> = BTreeMap::new();

        if !any_value {
            for entry in rules.iter() {
                let ActionEntry::Protocol {
                    protocol: Some(protocol),
                    ports,
                    ..
                } = entry
                else {
                    continue;
                };

                let spec = match ports {
                    Some(ports) if !ports.is_empty() => PortSpec::new(ports)?,
                    _ => PortSpec::all(),
                };

                expanded_rules
                    .entry(protocol.clone())
                    .and_modify(|existing| existing.merge(&spec))
                    .or_insert(spec);
            }
        }

        Ok(Self {
            action,
            rules,
            any_value,
            applies_to_all,
            expanded_rules,
        })
    }

    /// Builds an action from the raw JSON entries of an `allowed`/`denied` list
    pub fn from_values(action: ActionKind, values: &[Value]) -> Result<Self, FirewallActionError> {
        let rules = values
            .iter()
            .map(ActionEntry::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(action, rules)
    }

    /// An action which matches anything
    pub fn match_any(action: ActionKind) -> Self {
        Self {
            action,
            rules: vec![ActionEntry::Any],
            any_value: true,
            applies_to_all: false,
            expanded_rules: BTreeMap::new(),
        }
    }

    pub fn action(&self) -> ActionKind {
        self.action
    }

    pub fn rules(&self) -> &[ActionEntry] {
        &self.rules
    }

    pub fn any_value(&self) -> bool {
        self.any_value
    }

    pub fn applies_to_all(&self) -> bool {
        self.applies_to_all
    }

    pub fn expanded_rules(&self) -> &BTreeMap<String, PortSpec> {
        &self.expanded_rules
    }

    /// The entries rendered back to their API form
    pub fn json_value(&self) -> Value {
        Value::Array(self.rules.iter().map(|r| r.to_value()).collect())
    }

    /// Checks that the action could be submitted to the cloud API
    pub fn validate(&self) -> Result<(), FirewallActionError> {
        for entry in self.rules.iter() {
            let ActionEntry::Protocol {
                protocol,
                ports,
                extra,
            } = entry
            else {
                return Err(FirewallActionError::InvalidAction(
                    "action must have field IPProtocol".to_string(),
                ));
            };

            let Some(protocol) = protocol else {
                return Err(FirewallActionError::InvalidAction(
                    "action must have field IPProtocol".to_string(),
                ));
            };

            if let Some(ports) = ports {
                if protocol != "tcp" && protocol != "udp" {
                    return Err(FirewallActionError::InvalidAction(format!(
                        "only \"tcp\" and \"udp\" can have ports specified: {}",
                        protocol
                    )));
                }

                for port in ports.iter() {
                    parse_port_token(port)?;
                }
            }

            if !extra.is_empty() {
                return Err(FirewallActionError::InvalidAction(format!(
                    "action can only have \"IPProtocol\" and \"ports\": {}",
                    extra.keys().join(", ")
                )));
            }
        }

        Ok(())
    }

    /// Checks if the traffic covered by this action is also covered by `other`
    pub fn is_subset_of(&self, other: &FirewallAction) -> bool {
        if self.action != other.action {
            return false;
        }

        if self.any_value
            || other.any_value
            || other.applies_to_all
            || other.expanded_rules.is_empty()
        {
            return true;
        }

        self.expanded_rules
            .iter()
            .all(|(protocol, ports)| match other.expanded_rules.get(protocol) {
                Some(other_ports) => ports.is_subset(other_ports),
                None => false,
            })
    }

    /// Checks if this action covers all the traffic covered by `other`
    pub fn is_superset_of(&self, other: &FirewallAction) -> bool {
        if self.action != other.action {
            return false;
        }

        if self.any_value
            || other.any_value
            || self.applies_to_all
            || self.expanded_rules.is_empty()
        {
            return true;
        }

        other
            .expanded_rules
            .iter()
            .all(|(protocol, ports)| match self.expanded_rules.get(protocol) {
                Some(own_ports) => ports.is_subset(own_ports),
                None => false,
            })
    }

    /// Checks if both actions cover the same traffic, however it's written
    pub fn is_equivalent(&self, other: &FirewallAction) -> bool {
        if self.action != other.action {
            return false;
        }

        if self.any_value || other.any_value {
            return true;
        }

        self.expanded_rules.len() == other.expanded_rules.len()
            && self
                .expanded_rules
                .iter()
                .all(|(protocol, ports)| match other.expanded_rules.get(protocol) {
                    Some(other_ports) => ports.is_equal(other_ports),
                    None => false,
                })
    }
}

/// Structural equality of the canonical (sorted) entries
impl PartialEq for FirewallAction {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action && self.rules == other.rules
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::firewall::testing::{any_action, tcp_action};
    use anyhow::Result;
    use assert2::check;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("allowed", Some(ActionKind::Allowed))]
    #[case("denied", Some(ActionKind::Denied))]
    #[case("unknown", None)]
    #[case("ALLOWED", None)]
    fn test_action_kind(#[case] name: &str, #[case] value: Option<ActionKind>) {
        if let Some(v) = value {
            check!(ActionKind::from_str(name).unwrap() == v);
            check!(v.as_str() == name);
        } else {
            // an error case
            check!(ActionKind::from_str(name).is_err());
        }
    }

    #[test]
    fn test_entries_are_sorted() -> Result<()> {
        let action = FirewallAction::from_values(
            ActionKind::Allowed,
            &[
                json!({"IPProtocol": "udp", "ports": ["53"]}),
                json!({"IPProtocol": "tcp", "ports": ["8080", "22", "1000-2000", 443]}),
                json!({"IPProtocol": "icmp"}),
            ],
        )?;

        check!(
            action.rules()
                == [
                    ActionEntry::protocol::<&str>("icmp", &[]),
                    ActionEntry::protocol("tcp", &["22", "443", "1000-2000", "8080"]),
                    ActionEntry::protocol("udp", &["53"]),
                ]
        );
        check!(!action.any_value());
        check!(!action.applies_to_all());
        check!(action.expanded_rules()["icmp"].is_wildcard());
        check!(action.expanded_rules()["tcp"].set().contains(1500));
        Ok(())
    }

    #[test]
    fn test_match_any_list_is_untouched() -> Result<()> {
        let action = FirewallAction::from_values(ActionKind::Allowed, &[json!("*")])?;

        check!(action.any_value());
        check!(action.rules() == [ActionEntry::Any]);
        check!(action.expanded_rules().is_empty());
        check!(action == FirewallAction::match_any(ActionKind::Allowed));
        Ok(())
    }

    #[test]
    fn test_malformed_ports_fail_construction() {
        let res = FirewallAction::from_values(
            ActionKind::Allowed,
            &[json!({"IPProtocol": "tcp", "ports": ["70000"]})],
        );
        check!(let Err(FirewallActionError::InvalidPort(_)) = res);

        let res = FirewallAction::from_values(ActionKind::Allowed, &[json!("tcp")]);
        check!(let Err(FirewallActionError::InvalidAction(_)) = res);
    }

    #[rstest]
    #[case::valid(json!({"IPProtocol": "tcp", "ports": ["22", "1-1024"]}), true)]
    #[case::no_ports(json!({"IPProtocol": "icmp"}), true)]
    #[case::missing_protocol(json!({"ports": ["22"]}), false)]
    #[case::ports_on_icmp(json!({"IPProtocol": "icmp", "ports": ["22"]}), false)]
    #[case::stray_key(json!({"IPProtocol": "tcp", "foo": "bar"}), false)]
    #[case::all_is_not_a_port(json!({"IPProtocol": "tcp", "ports": ["all"]}), false)]
    #[case::match_any(json!("*"), false)]
    fn test_validate(#[case] entry: Value, #[case] valid: bool) -> Result<()> {
        let action = FirewallAction::from_values(ActionKind::Allowed, &[entry])?;
        check!(action.validate().is_ok() == valid);
        Ok(())
    }

    #[test]
    fn test_subset_and_superset() -> Result<()> {
        let narrow = tcp_action(&["22"]);
        let wide = tcp_action(&["1-1024"]);

        check!(narrow.is_subset_of(&wide));
        check!(!wide.is_subset_of(&narrow));
        check!(wide.is_superset_of(&narrow));
        check!(!narrow.is_superset_of(&wide));

        // a protocol which the other side doesn't have
        let mixed = FirewallAction::new(
            ActionKind::Allowed,
            vec![
                ActionEntry::protocol("tcp", &["22"]),
                ActionEntry::protocol("udp", &["53"]),
            ],
        )?;
        check!(!mixed.is_subset_of(&wide));
        check!(mixed.is_superset_of(&narrow));

        // protocol "all" contains everything
        let all = FirewallAction::new(ActionKind::Allowed, vec![ActionEntry::protocol::<&str>("all", &[])])?;
        check!(all.applies_to_all());
        check!(mixed.is_subset_of(&all));
        check!(all.is_superset_of(&mixed));
        Ok(())
    }

    #[test]
    fn test_different_action_kinds_never_compare() -> Result<()> {
        let allowed = tcp_action(&["22"]);
        let denied = FirewallAction::new(ActionKind::Denied, vec![ActionEntry::protocol("tcp", &["22"])])?;

        check!(!allowed.is_subset_of(&denied));
        check!(!allowed.is_superset_of(&denied));
        check!(!allowed.is_equivalent(&denied));
        check!(allowed != denied);
        Ok(())
    }

    #[rstest]
    fn test_wildcard_absorption(any_action: FirewallAction) {
        let x = tcp_action(&["22", "8000-9000"]);

        check!(any_action.any_value());
        check!(x.is_subset_of(&any_action));
        check!(any_action.is_superset_of(&x));
        check!(x.is_equivalent(&any_action));
    }

    #[test]
    fn test_equality_vs_equivalence() -> Result<()> {
        let a = tcp_action(&["80", "81"]);
        let b = tcp_action(&["81", "80"]);
        let c = tcp_action(&["80-81"]);

        // sorted on construction, so the order of the ports doesn't matter
        check!(a == b);
        check!(a != c);
        check!(a.is_equivalent(&c));
        check!(!a.is_equivalent(&tcp_action(&["80"])));

        let split = FirewallAction::new(
            ActionKind::Allowed,
            vec![
                ActionEntry::protocol("tcp", &["80"]),
                ActionEntry::protocol("tcp", &["81"]),
            ],
        )?;
        check!(split.is_equivalent(&c));
        Ok(())
    }

    #[test]
    fn test_json_value() -> Result<()> {
        let action = tcp_action(&["443", "80"]);
        check!(action.json_value() == json!([{"IPProtocol": "tcp", "ports": ["80", "443"]}]));
        Ok(())
    }
}
