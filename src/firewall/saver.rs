use anyhow::Result;

use super::violations::RuleViolation;

/// Trait which defines the method for saving the violations found by an audit
pub trait ViolationSerializer {
    /// Returns the violations serialized to a string
    fn serialize(&self, violations: &[RuleViolation]) -> Result<String>;
    fn serialize_violation(&self, v: &RuleViolation) -> Result<String>;
}

/// Saves violations as a YAML document
pub struct Yaml;

impl ViolationSerializer for Yaml {
    fn serialize_violation(&self, v: &RuleViolation) -> Result<String> {
        Ok(serde_yaml::to_string(v)?)
    }

    fn serialize(&self, violations: &[RuleViolation]) -> Result<String> {
        Ok(serde_yaml::to_string(violations)?)
    }
}

/// Saves violations as pretty-printed JSON
pub struct Json;

impl ViolationSerializer for Json {
    fn serialize_violation(&self, v: &RuleViolation) -> Result<String> {
        Ok(serde_json::to_string_pretty(v)?)
    }

    fn serialize(&self, violations: &[RuleViolation]) -> Result<String> {
        Ok(serde_json::to_string_pretty(violations)?)
    }
}
