//! Policy registry: named, versioned whitelists.
//!
//! Built once at startup from the embedded builtin document plus any
//! policy files named in the configuration, then shared read-only.
//! Lookups go through `resolve()`, which also follows aliases
//! (e.g. `default` → `standard-v1`).
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{PolicySpec, Whitelist};
use crate::error::{Result, SandboxError};

/// Builtin policies shipped with the binary.
const BUILTIN_POLICIES: &str = include_str!("builtin.toml");

/// On-disk layout of a policy document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    #[serde(default)]
    policy: BTreeMap<String, PolicySpec>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Whitelist>>,
    aliases: HashMap<String, String>,
}

impl PolicyRegistry {
    /// Empty registry. Mostly useful in tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the embedded builtin policies.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.load_str(BUILTIN_POLICIES)?;
        Ok(registry)
    }

    /// Builtin policies followed by each file in `files`, in order.
    pub fn with_files<P: AsRef<Path>>(files: &[P]) -> Result<Self> {
        let mut registry = Self::builtin()?;
        for file in files {
            registry.load_file(file.as_ref())?;
        }
        Ok(registry)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading policies from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        self.load_str(&content)
    }

    /// Parses a policy document and merges it into the registry.
    ///
    /// The whole document is validated before anything is registered,
    /// so a bad document leaves the registry unchanged.
    pub fn load_str(&mut self, document: &str) -> Result<()> {
        let doc: PolicyDocument = toml::from_str(document)?;

        let mut parsed = Vec::with_capacity(doc.policy.len());
        for (name, spec) in doc.policy {
            parsed.push(Whitelist::from_spec(&name, spec)?);
        }

        for (alias, target) in &doc.aliases {
            let known = self.policies.contains_key(target)
                || parsed.iter().any(|wl| wl.name() == target);
            if !known {
                return Err(SandboxError::invalid_policy(
                    alias,
                    format!("alias points to unknown policy '{target}'"),
                ));
            }
            if parsed.iter().any(|wl| wl.name() == alias) || self.policies.contains_key(alias) {
                return Err(SandboxError::invalid_policy(
                    alias,
                    "alias shadows a registered policy name",
                ));
            }
        }

        for whitelist in parsed {
            self.register(whitelist);
        }
        for (alias, target) in doc.aliases {
            debug!("Policy alias {alias} → {target}");
            self.aliases.insert(alias, target);
        }
        Ok(())
    }

    /// Registers a policy, replacing any previous one with the same name.
    pub fn register(&mut self, whitelist: Whitelist) {
        let name = whitelist.name().to_string();
        if self.policies.contains_key(&name) {
            warn!("Policy {name} redefined, replacing previous definition");
        }
        self.aliases.remove(&name);
        self.policies.insert(name, Arc::new(whitelist));
    }

    /// Looks up a policy by name or alias.
    pub fn resolve(&self, name: &str) -> Result<Arc<Whitelist>> {
        if let Some(whitelist) = self.policies.get(name) {
            return Ok(Arc::clone(whitelist));
        }
        self.aliases
            .get(name)
            .and_then(|target| self.policies.get(target))
            .map(Arc::clone)
            .ok_or_else(|| SandboxError::UnknownPolicy(name.to_string()))
    }

    /// Registered policy names, sorted (aliases excluded).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Alias → target pairs, sorted by alias.
    pub fn aliases(&self) -> Vec<(String, String)> {
        let mut aliases: Vec<(String, String)> = self
            .aliases
            .iter()
            .map(|(a, t)| (a.clone(), t.clone()))
            .collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
