//! Finding the ancestors of a resource in the hierarchy
use super::parser::tokenize_full_name;
use super::resources::{Resource, ResourceError, ResourceType};
use std::str::FromStr;
use tracing::debug;

/// Produces the ancestor chain of a resource: the resource itself, then its ancestors
/// nearest first
pub trait AncestorResolver {
    fn find_ancestors(&self, resource: &Resource, full_name: &str) -> Result<Vec<Resource>, ResourceError>;
}

/// Resolves ancestors by walking the `type/id` pairs of the full name, without calling
/// any external API
#[derive(Clone, Copy, Debug, Default)]
pub struct HierarchicalNameResolver;

impl AncestorResolver for HierarchicalNameResolver {
    fn find_ancestors(&self, resource: &Resource, full_name: &str) -> Result<Vec<Resource>, ResourceError> {
        find_ancestors_by_hierarchical_name(resource, full_name)
    }
}

/// Returns `resource` followed by the resources named before it in `full_name`, nearest
/// first. When the resource itself can't be located in the full name, every resource
/// named there is taken as an ancestor.
pub fn find_ancestors_by_hierarchical_name(
    resource: &Resource,
    full_name: &str,
) -> Result<Vec<Resource>, ResourceError> {
    let pairs = tokenize_full_name(full_name)?;

    let parsed = pairs
        .iter()
        .map(|(kind, id)| (ResourceType::from_str(kind).ok(), *kind, *id))
        .collect::<Vec<_>>();

    let own_position = parsed
        .iter()
        .rposition(|(t, _, id)| *t == Some(resource.resource_type) && *id == resource.id)
        .or_else(|| parsed.iter().rposition(|(t, _, _)| *t == Some(resource.resource_type)));

    let end = own_position.unwrap_or(parsed.len());

    let mut ancestors = vec![];
    let mut prefix = String::new();

    for (resource_type, kind, id) in parsed[..end].iter() {
        prefix.push_str(&format!("{}/{}/", kind, id));

        let Some(resource_type) = resource_type else {
            debug!(target: "ancestors", "skipping unknown resource type {} in {}", kind, full_name);
            continue;
        };

        ancestors.push(Resource::new(*resource_type, id).with_full_name(&prefix));
    }

    ancestors.push(resource.clone());
    ancestors.reverse();

    Ok(ancestors)
}
