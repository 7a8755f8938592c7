//! Loads the policy definitions and evaluates resources against them
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use parking_lot::ReentrantMutex;
use tracing::{debug, info, warn};

use super::ancestors::HierarchicalNameResolver;
use super::config_files::RuleDefinitions;
use super::resources::Resource;
use super::rulebook::{Resolver, RuleBook};
use super::rules::FirewallRule;
use super::violations::RuleViolation;

/// Where the policy definitions come from
#[derive(Clone, Debug)]
pub enum RulesSource {
    File(PathBuf),
    Definitions(RuleDefinitions),
}

impl RulesSource {
    fn load(&self) -> Result<RuleDefinitions> {
        match self {
            RulesSource::File(path) => RuleDefinitions::load(path),
            RulesSource::Definitions(defs) => Ok(defs.clone()),
        }
    }
}

/// Evaluates live firewall rules against the policy definitions.
///
/// The rule book is built on first use, or explicitly with
/// [FirewallRulesEngine::build_rule_book]. Builds are serialized; a new rule book is
/// only published once complete, so concurrent evaluations see either the old one or
/// the new one.
pub struct FirewallRulesEngine {
    source: RulesSource,
    resolver: Resolver,
    rule_book: ArcSwapOption<RuleBook>,
    build_lock: ReentrantMutex<()>,
}

impl FirewallRulesEngine {
    /// An engine reading its policy definitions from a YAML file
    pub fn new(path: &Path) -> Self {
        Self::with_source(RulesSource::File(path.to_path_buf()))
    }

    pub fn from_definitions(defs: RuleDefinitions) -> Self {
        Self::with_source(RulesSource::Definitions(defs))
    }

    pub fn with_source(source: RulesSource) -> Self {
        Self {
            source,
            resolver: Arc::new(HierarchicalNameResolver),
            rule_book: ArcSwapOption::empty(),
            build_lock: ReentrantMutex::new(()),
        }
    }

    /// Replaces the ancestor resolver used by the rule books built from now on
    pub fn with_resolver(self, resolver: Resolver) -> Self {
        Self { resolver, ..self }
    }

    pub fn is_built(&self) -> bool {
        self.rule_book.load().is_some()
    }

    /// Number of policy rules of the current rule book, 0 when not built yet
    pub fn rule_count(&self) -> usize {
        self.rule_book
            .load_full()
            .map(|book| book.rule_count())
            .unwrap_or(0)
    }

    /// (Re)builds the rule book and publishes it. On error the previous rule book, if
    /// any, stays in place.
    pub fn build_rule_book(&self) -> Result<Arc<RuleBook>> {
        let _guard = self.build_lock.lock();

        info!(target: "engine", "building rule book");

        let defs = self.source.load()?;
        let book = Arc::new(RuleBook::build(&defs, self.resolver.clone()).context("cannot build rule book")?);

        self.rule_book.store(Some(book.clone()));

        info!(target: "engine", "rule book ready: {} rules", book.rule_count());

        Ok(book)
    }

    fn current_rule_book(&self, force_rebuild: bool) -> Result<Arc<RuleBook>> {
        if !force_rebuild {
            if let Some(book) = self.rule_book.load_full() {
                return Ok(book);
            }
        }

        let _guard = self.build_lock.lock();

        // another caller may have finished a build while we waited
        if !force_rebuild {
            if let Some(book) = self.rule_book.load_full() {
                return Ok(book);
            }
        }

        self.build_rule_book()
    }

    /// Evaluates the live firewall rules of one resource
    pub fn find_policy_violations(
        &self,
        resource: &Resource,
        policies: &[FirewallRule],
        force_rebuild: bool,
    ) -> Result<Vec<RuleViolation>> {
        let book = self.current_rule_book(force_rebuild)?;

        debug!(target: "engine",
            "evaluating {} firewall rules of {}/{}",
            policies.len(),
            resource.resource_type,
            resource.id
        );

        let violations = book
            .find_violations(resource, policies)
            .with_context(|| format!("cannot evaluate {}/{}", resource.resource_type, resource.id))?;

        Ok(violations)
    }

    /// Evaluates several resources. A resource which can't be evaluated is logged and
    /// skipped; failing to build the rule book is an error.
    pub fn find_violations_batch<'a, I>(&self, items: I) -> Result<Vec<RuleViolation>>
    where
        I: IntoIterator<Item = (&'a Resource, &'a [FirewallRule])>,
    {
        let book = self.current_rule_book(false)?;
        let mut violations = vec![];

        for (resource, policies) in items {
            match book.find_violations(resource, policies) {
                Ok(found) => violations.extend(found),
                Err(e) => warn!(target: "engine",
                    "skipping {}/{}: {}",
                    resource.resource_type,
                    resource.id,
                    e
                ),
            }
        }

        Ok(violations)
    }
}
