//! Execution policies: what candidate code may import, call and touch.
//!
//! A [`Whitelist`] is built once from a declarative [`PolicySpec`] and is
//! read-only afterwards. The same object is consulted by the static
//! analyzer and shipped to the worker process, so both layers enforce one
//! definition of "allowed".

pub mod registry;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Result, SandboxError};

pub use registry::PolicyRegistry;

/// Category of a finding produced by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    /// The source could not be parsed (or exceeded parser limits).
    SyntaxViolation,
    /// Import of a module outside the whitelist, or a relative import.
    ForbiddenImport,
    /// Reference to a forbidden identifier or attribute.
    ForbiddenCall,
    /// Attribute of a whitelisted module that its rule does not list.
    UnlistedAttribute,
    /// A Python builtin that the policy does not bind.
    UnlistedBuiltin,
    /// Legal but discouraged construct (`global`, star imports).
    DiscouragedConstruct,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 6] = [
        ViolationKind::SyntaxViolation,
        ViolationKind::ForbiddenImport,
        ViolationKind::ForbiddenCall,
        ViolationKind::UnlistedAttribute,
        ViolationKind::UnlistedBuiltin,
        ViolationKind::DiscouragedConstruct,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ViolationKind::SyntaxViolation => "SyntaxViolation",
            ViolationKind::ForbiddenImport => "ForbiddenImport",
            ViolationKind::ForbiddenCall => "ForbiddenCall",
            ViolationKind::UnlistedAttribute => "UnlistedAttribute",
            ViolationKind::UnlistedBuiltin => "UnlistedBuiltin",
            ViolationKind::DiscouragedConstruct => "DiscouragedConstruct",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Kinds that indicate possible host interaction. Always blocking.
    pub fn is_host_interaction(self) -> bool {
        matches!(
            self,
            ViolationKind::SyntaxViolation
                | ViolationKind::ForbiddenImport
                | ViolationKind::ForbiddenCall
                | ViolationKind::UnlistedAttribute
        )
    }

    pub fn default_severity(self) -> Severity {
        if self.is_host_interaction() {
            Severity::Blocking
        } else {
            Severity::Advisory
        }
    }
}

/// Whether a finding prevents execution or only lowers the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Advisory,
}

impl Severity {
    /// Score penalty applied per finding of this severity.
    pub fn penalty(self) -> f64 {
        match self {
            Severity::Blocking => 0.3,
            Severity::Advisory => 0.05,
        }
    }
}

/// Which attributes of an allowed module candidate code may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleRule {
    All,
    Only(BTreeSet<String>),
}

impl ModuleRule {
    pub fn allows(&self, attribute: &str) -> bool {
        match self {
            ModuleRule::All => true,
            ModuleRule::Only(attrs) => attrs.contains(attribute),
        }
    }
}

impl Serialize for ModuleRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ModuleRule::All => serializer.serialize_str("*"),
            ModuleRule::Only(attrs) => attrs.serialize(serializer),
        }
    }
}

/// Module entry as written in a policy document: `"*"` or a list of attributes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModuleSpec {
    Wildcard(String),
    Attributes(Vec<String>),
}

/// Declarative form of a policy, as found under `[policy.<name>]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySpec {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub builtins: Vec<String>,
    #[serde(default)]
    pub forbidden: Vec<String>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleSpec>,
    /// Keys are [`ViolationKind`] names, e.g. `UnlistedBuiltin = "blocking"`.
    #[serde(default)]
    pub severity: BTreeMap<String, Severity>,
}

fn default_version() -> u32 {
    1
}

/// Immutable allow-list consulted by the analyzer and the worker.
#[derive(Debug, Clone, Serialize)]
pub struct Whitelist {
    name: String,
    version: u32,
    description: String,
    modules: BTreeMap<String, ModuleRule>,
    builtins: BTreeSet<String>,
    forbidden: BTreeSet<String>,
    severities: BTreeMap<ViolationKind, Severity>,
}

impl Whitelist {
    /// Validates a declarative spec and freezes it into a whitelist.
    pub fn from_spec(name: &str, spec: PolicySpec) -> Result<Self> {
        if !is_identifier_like(name, &['-', '_', '.']) {
            return Err(SandboxError::invalid_policy(name, "policy names may only contain letters, digits, '-', '_' and '.'"));
        }

        let forbidden: BTreeSet<String> = spec.forbidden.into_iter().collect();
        for ident in &forbidden {
            if !is_identifier_like(ident, &[]) {
                return Err(SandboxError::invalid_policy(name, format!("'{ident}' is not an identifier")));
            }
        }

        let mut builtins = BTreeSet::new();
        for builtin in spec.builtins {
            if !is_identifier_like(&builtin, &[]) {
                return Err(SandboxError::invalid_policy(name, format!("'{builtin}' is not an identifier")));
            }
            if forbidden.contains(&builtin) {
                return Err(SandboxError::invalid_policy(
                    name,
                    format!("builtin '{builtin}' is both allowed and forbidden"),
                ));
            }
            builtins.insert(builtin);
        }

        let mut modules = BTreeMap::new();
        for (module, entry) in spec.modules {
            if !is_identifier_like(&module, &[]) {
                return Err(SandboxError::invalid_policy(
                    name,
                    format!("module '{module}' must be a top-level module name"),
                ));
            }
            let rule = match entry {
                ModuleSpec::Wildcard(w) if w == "*" => ModuleRule::All,
                ModuleSpec::Wildcard(w) => {
                    return Err(SandboxError::invalid_policy(
                        name,
                        format!("module '{module}': expected \"*\" or a list of attributes, got \"{w}\""),
                    ));
                }
                ModuleSpec::Attributes(attrs) => {
                    if let Some(bad) = attrs.iter().find(|a| forbidden.contains(*a)) {
                        return Err(SandboxError::invalid_policy(
                            name,
                            format!("module '{module}' lists forbidden attribute '{bad}'"),
                        ));
                    }
                    ModuleRule::Only(attrs.into_iter().collect())
                }
            };
            modules.insert(module, rule);
        }

        let mut severities: BTreeMap<ViolationKind, Severity> = ViolationKind::ALL
            .iter()
            .map(|kind| (*kind, kind.default_severity()))
            .collect();
        for (key, severity) in spec.severity {
            let kind = ViolationKind::from_name(&key).ok_or_else(|| {
                SandboxError::invalid_policy(name, format!("unknown violation kind '{key}'"))
            })?;
            if kind.is_host_interaction() && severity != Severity::Blocking {
                return Err(SandboxError::invalid_policy(
                    name,
                    format!("{key} findings cannot be downgraded from blocking"),
                ));
            }
            severities.insert(kind, severity);
        }

        Ok(Self {
            name: name.to_string(),
            version: spec.version,
            description: spec.description,
            modules,
            builtins,
            forbidden,
            severities,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn allows_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    pub fn module_rule(&self, module: &str) -> Option<&ModuleRule> {
        self.modules.get(module)
    }

    /// True if `attribute` of the top-level `module` may be accessed.
    pub fn allows_module_attribute(&self, module: &str, attribute: &str) -> bool {
        !self.is_forbidden(attribute)
            && self
                .modules
                .get(module)
                .is_some_and(|rule| rule.allows(attribute))
    }

    pub fn allows_builtin(&self, name: &str) -> bool {
        self.builtins.contains(name)
    }

    pub fn is_forbidden(&self, identifier: &str) -> bool {
        self.forbidden.contains(identifier)
    }

    /// Total over [`ViolationKind`]: every kind has exactly one severity.
    pub fn severity_of(&self, kind: ViolationKind) -> Severity {
        self.severities
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_severity())
    }

    pub fn modules(&self) -> impl Iterator<Item = (&str, &ModuleRule)> {
        self.modules.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn builtins(&self) -> impl Iterator<Item = &str> {
        self.builtins.iter().map(String::as_str)
    }

    pub fn forbidden(&self) -> impl Iterator<Item = &str> {
        self.forbidden.iter().map(String::as_str)
    }
}

/// ASCII identifier check, optionally admitting extra punctuation.
fn is_identifier_like(s: &str, extra: &[char]) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || extra.contains(&c))
}
