use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::executor::{MAX_MEMORY_LIMIT_MB, MAX_TIMEOUT_SECS};

/// Looked up when no configuration path is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "config/funcbox.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub policies: PolicyConfig,
}

/// Execution defaults applied when a submission omits them.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Master switch. When false every execution is refused.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: f64,
    #[serde(default = "default_memory_limit_mb")]
    pub default_memory_limit_mb: u64,
    #[serde(default = "default_policy")]
    pub default_policy: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Interpreter binary, resolved through PATH.
    #[serde(default = "default_python")]
    pub python: String,
    /// Address space granted on top of the request's memory limit, covering
    /// the interpreter itself (shared libraries, heap arenas).
    #[serde(default = "default_interpreter_overhead_mb")]
    pub interpreter_overhead_mb: u64,
    /// Per-stream cap on captured stdout/stderr.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// Extra policy documents merged over the builtin ones, in order.
    /// Supports ${ENV_VAR} substitution.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> f64 {
    5.0
}

fn default_memory_limit_mb() -> u64 {
    64
}

fn default_policy() -> String {
    "default".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_interpreter_overhead_mb() -> u64 {
    256
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_timeout_secs: default_timeout_secs(),
            default_memory_limit_mb: default_memory_limit_mb(),
            default_policy: default_policy(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            interpreter_overhead_mb: default_interpreter_overhead_mb(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {path}"))?;
        // Expand environment variables like ${FUNCBOX_POLICY_DIR}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given; otherwise the default path if it exists,
    /// otherwise built-in defaults. Environment overrides are applied last.
    pub fn load_or_default(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `FUNCBOX_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(v) = lookup("FUNCBOX_SANDBOX_ENABLED") {
            self.sandbox.enabled = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => bail!("FUNCBOX_SANDBOX_ENABLED: expected a boolean, got '{other}'"),
            };
        }
        if let Some(v) = lookup("FUNCBOX_DEFAULT_TIMEOUT_SECS") {
            self.sandbox.default_timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("FUNCBOX_DEFAULT_TIMEOUT_SECS: invalid number '{v}'"))?;
        }
        if let Some(v) = lookup("FUNCBOX_DEFAULT_MEMORY_MB") {
            self.sandbox.default_memory_limit_mb = v
                .trim()
                .parse()
                .with_context(|| format!("FUNCBOX_DEFAULT_MEMORY_MB: invalid number '{v}'"))?;
        }
        if let Some(v) = lookup("FUNCBOX_PYTHON") {
            self.worker.python = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let timeout = self.sandbox.default_timeout_secs;
        if !(timeout.is_finite() && timeout > 0.0) {
            bail!("sandbox.default_timeout_secs must be a positive number, got {timeout}");
        }
        if timeout > MAX_TIMEOUT_SECS {
            bail!("sandbox.default_timeout_secs exceeds the maximum of {MAX_TIMEOUT_SECS}s");
        }
        let memory = self.sandbox.default_memory_limit_mb;
        if memory == 0 || memory > MAX_MEMORY_LIMIT_MB {
            bail!("sandbox.default_memory_limit_mb must be between 1 and {MAX_MEMORY_LIMIT_MB}, got {memory}");
        }
        if self.sandbox.default_policy.trim().is_empty() {
            bail!("sandbox.default_policy must name a policy");
        }
        if self.worker.python.trim().is_empty() {
            bail!("worker.python must name an interpreter");
        }
        if self.worker.max_output_bytes == 0 {
            bail!("worker.max_output_bytes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── defaults ────────────────────────────────────────

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.sandbox.enabled);
        assert_eq!(config.sandbox.default_timeout_secs, 5.0);
        assert_eq!(config.sandbox.default_memory_limit_mb, 64);
        assert_eq!(config.sandbox.default_policy, "default");
        assert_eq!(config.worker.python, "python3");
        assert_eq!(config.worker.interpreter_overhead_mb, 256);
        assert_eq!(config.worker.max_output_bytes, 65536);
        assert!(config.policies.files.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sandbox.default_timeout_secs, 5.0);
        assert_eq!(config.worker.python, "python3");
    }

    #[test]
    fn test_partial_section() {
        let config: Config = toml::from_str("[sandbox]\ndefault_timeout_secs = 2.5\n").unwrap();
        assert_eq!(config.sandbox.default_timeout_secs, 2.5);
        assert_eq!(config.sandbox.default_memory_limit_mb, 64);
        assert!(config.sandbox.enabled);
    }

    // ── loading ─────────────────────────────────────────

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("FUNCBOX_TEST_POLICY_DIR", "/srv/policies");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("funcbox.toml");
        std::fs::write(
            &path,
            "[sandbox]\ndefault_policy = \"strict\"\n\n[policies]\nfiles = [\"${FUNCBOX_TEST_POLICY_DIR}/extra.toml\"]\n",
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.sandbox.default_policy, "strict");
        assert_eq!(
            config.policies.files,
            vec![PathBuf::from("/srv/policies/extra.toml")]
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/funcbox.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/funcbox.toml"));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("funcbox.toml");
        std::fs::write(&path, "[sandbox]\ndefault_timeout_secs = 0.0\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());

        std::fs::write(&path, "[worker]\npython = \"\"\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());

        std::fs::write(&path, "[sandbox]\ndefault_timeout_secs = 3600.0\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());

        std::fs::write(&path, "[sandbox]\ndefault_memory_limit_mb = 100000\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());

        std::fs::write(&path, "[sandbox]\ndefault_policy = \"\"\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());
    }

    // ── environment overrides ───────────────────────────

    #[test]
    fn test_overrides_applied() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup_from(&[
                ("FUNCBOX_SANDBOX_ENABLED", "false"),
                ("FUNCBOX_DEFAULT_TIMEOUT_SECS", "1.5"),
                ("FUNCBOX_DEFAULT_MEMORY_MB", "128"),
                ("FUNCBOX_PYTHON", "/usr/bin/python3.12"),
            ]))
            .unwrap();
        assert!(!config.sandbox.enabled);
        assert_eq!(config.sandbox.default_timeout_secs, 1.5);
        assert_eq!(config.sandbox.default_memory_limit_mb, 128);
        assert_eq!(config.worker.python, "/usr/bin/python3.12");
    }

    #[test]
    fn test_no_overrides_leaves_config_alone() {
        let mut config = Config::default();
        config.apply_overrides(|_| None).unwrap();
        assert!(config.sandbox.enabled);
        assert_eq!(config.sandbox.default_timeout_secs, 5.0);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(lookup_from(&[("FUNCBOX_SANDBOX_ENABLED", "maybe")]))
            .is_err());
        assert!(config
            .apply_overrides(lookup_from(&[("FUNCBOX_DEFAULT_MEMORY_MB", "lots")]))
            .is_err());
    }
}
