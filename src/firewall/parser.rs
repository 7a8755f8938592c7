use pest::Parser;
use pest_derive::Parser;
use tracing::error;

use super::resources::ResourceError;

#[derive(Parser)]
#[grammar = "firewall/full_name.pest"]
pub struct FullNameParser;

fn invalid(full_name: &str, reason: impl ToString) -> ResourceError {
    ResourceError::InvalidFullName {
        full_name: full_name.to_string(),
        reason: reason.to_string(),
    }
}

/// Splits a full name (`organization/1/folder/2/project/p/`) into its `(type, id)`
/// pairs, root first
pub fn tokenize_full_name(full_name: &str) -> Result<Vec<(&str, &str)>, ResourceError> {
    let parsed = FullNameParser::parse(Rule::full_name, full_name)
        .map_err(|e| invalid(full_name, e))?
        .next()
        .ok_or_else(|| invalid(full_name, "empty parse"))?;

    let mut result: Vec<(&str, &str)> = Vec::new();

    for p in parsed.into_inner() {
        match p.as_rule() {
            Rule::pair => {
                let mut inner = p.into_inner();

                let (Some(kind), Some(id)) = (inner.next(), inner.next()) else {
                    return Err(invalid(full_name, "incomplete type/id pair"));
                };

                result.push((kind.as_str(), id.as_str()));
            }
            Rule::EOI => {}
            _ => error!("unexpected token in full name: {:?}", p.as_rule()),
        }
    }

    Ok(result)
}
