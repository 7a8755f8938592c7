use crate::firewall::actions::{ActionEntry, ActionKind, FirewallAction};
use crate::firewall::config_files::RuleDefinitions;
use crate::firewall::resources::{Resource, ResourceType};
use crate::firewall::rules::{FirewallRule, FirewallRuleBuilder, FirewallRuleError, INGRESS};
use rstest::fixture;
use std::path::PathBuf;

//
// Actions and rules for building up policies
//
pub fn tcp(ports: &[&str]) -> ActionEntry {
    ActionEntry::protocol("tcp", ports)
}

pub fn tcp_action(ports: &[&str]) -> FirewallAction {
    FirewallAction::new(ActionKind::Allowed, vec![tcp(ports)]).unwrap()
}

#[fixture]
pub fn any_action() -> FirewallAction {
    FirewallAction::match_any(ActionKind::Allowed)
}

#[fixture]
pub fn ingress_rule() -> FirewallRule {
    FirewallRuleBuilder::new()
        .name("ingress-rule")
        .network("default")
        .direction(INGRESS)
        .source_ranges(["10.0.0.0/8"])
        .allow(tcp(&["22"]))
        .build()
        .unwrap()
}

/// A live ingress rule of `my-project`, allowing tcp traffic on `ports` from `ranges`
pub fn live_rule(name: &str, ranges: &[&str], ports: &[&str]) -> Result<FirewallRule, FirewallRuleError> {
    FirewallRuleBuilder::new()
        .project_id("my-project")
        .name(name)
        .full_name(&format!("organization/1/project/my-project/firewall/{}/", name))
        .network("default")
        .direction(INGRESS)
        .source_ranges(ranges)
        .allow(tcp(ports))
        .build()
}

#[fixture]
pub fn project() -> Resource {
    Resource::new(ResourceType::Project, "my-project").with_full_name("organization/1/project/my-project/")
}

#[fixture]
pub fn test_dir() -> PathBuf {
    let mut test_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    test_dir.push("resources");
    test_dir
}

#[fixture]
pub fn definitions(test_dir: PathBuf) -> RuleDefinitions {
    RuleDefinitions::load(&test_dir.join("rules.yaml")).unwrap()
}
