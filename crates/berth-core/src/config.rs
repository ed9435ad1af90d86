//! Runtime configuration.
//!
//! Layering: built-in defaults, then `BERTH_*` environment variables, then
//! CLI flags applied by the binary. The result is passed to the coordinator
//! at construction.

use std::path::PathBuf;
use std::str::FromStr;

use crate::registry::OciRegistryConfig;
use crate::telemetry::LogFormat;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_MAX_PARALLEL_BUILDS: usize = 4;

/// Configuration could not be read.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

/// Where image digests are looked up and registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistryBackend {
    /// Remote OCI registries over HTTP
    #[default]
    Oci,
    /// Local JSON index under the state directory
    Local,
}

impl FromStr for RegistryBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oci" | "remote" => Ok(RegistryBackend::Oci),
            "local" => Ok(RegistryBackend::Local),
            other => Err(format!("unknown registry backend '{other}' (expected oci or local)")),
        }
    }
}

/// Settings the coordinator itself consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub namespace: String,
    /// Registry used to derive tags for components without an image
    pub dev_registry: Option<String>,
    pub max_parallel_builds: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            dev_registry: None,
            max_parallel_builds: DEFAULT_MAX_PARALLEL_BUILDS,
        }
    }
}

/// Full Berth configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerthConfig {
    pub namespace: String,
    /// Root of pipeline records and the local artifact index
    pub state_dir: PathBuf,
    pub dev_registry: Option<String>,
    pub registry_backend: RegistryBackend,
    pub registry_username: Option<String>,
    pub registry_password: Option<String>,
    pub insecure_registries: Vec<String>,
    pub registry_timeout_secs: u64,
    pub max_parallel_builds: usize,
    /// Per deploy/destroy command; zero disables
    pub command_timeout_secs: u64,
    /// Push tagged images after building
    pub push: bool,
    pub log_format: LogFormat,
}

impl Default for BerthConfig {
    fn default() -> Self {
        let state_dir = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".berth"))
            .unwrap_or_else(|| PathBuf::from(".berth"));
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            state_dir,
            dev_registry: None,
            registry_backend: RegistryBackend::default(),
            registry_username: None,
            registry_password: None,
            insecure_registries: Vec::new(),
            registry_timeout_secs: 30,
            max_parallel_builds: DEFAULT_MAX_PARALLEL_BUILDS,
            command_timeout_secs: 0,
            push: true,
            log_format: LogFormat::Text,
        }
    }
}

impl BerthConfig {
    /// Defaults overlaid with the process environment.
    ///
    /// Reads:
    /// - BERTH_NAMESPACE
    /// - BERTH_STATE_DIR
    /// - BERTH_DEV_REGISTRY
    /// - BERTH_REGISTRY_BACKEND (`oci` | `local`)
    /// - BERTH_REGISTRY_USERNAME / BERTH_REGISTRY_PASSWORD
    /// - BERTH_INSECURE_REGISTRIES (comma separated)
    /// - BERTH_REGISTRY_TIMEOUT_SECS
    /// - BERTH_MAX_PARALLEL_BUILDS
    /// - BERTH_COMMAND_TIMEOUT_SECS
    /// - BERTH_PUSH (`true` | `false`)
    /// - BERTH_LOG_FORMAT (`text` | `json`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(ns) = get("BERTH_NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(dir) = get("BERTH_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        config.dev_registry = get("BERTH_DEV_REGISTRY");
        if let Some(v) = get("BERTH_REGISTRY_BACKEND") {
            config.registry_backend = parse_var("BERTH_REGISTRY_BACKEND", &v)?;
        }
        config.registry_username = get("BERTH_REGISTRY_USERNAME");
        config.registry_password = get("BERTH_REGISTRY_PASSWORD");
        if let Some(v) = get("BERTH_INSECURE_REGISTRIES") {
            config.insecure_registries = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("BERTH_REGISTRY_TIMEOUT_SECS") {
            config.registry_timeout_secs = parse_var("BERTH_REGISTRY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("BERTH_MAX_PARALLEL_BUILDS") {
            config.max_parallel_builds = parse_var("BERTH_MAX_PARALLEL_BUILDS", &v)?;
        }
        if let Some(v) = get("BERTH_COMMAND_TIMEOUT_SECS") {
            config.command_timeout_secs = parse_var("BERTH_COMMAND_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("BERTH_PUSH") {
            config.push = parse_var("BERTH_PUSH", &v.to_lowercase())?;
        }
        if let Some(v) = get("BERTH_LOG_FORMAT") {
            config.log_format = parse_var("BERTH_LOG_FORMAT", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordinator cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_builds == 0 {
            return Err(ConfigError::Invalid {
                var: "max_parallel_builds".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid {
                var: "namespace".to_string(),
                value: self.namespace.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_dev_registry(mut self, registry: impl Into<String>) -> Self {
        self.dev_registry = Some(registry.into());
        self
    }

    /// Directory holding pipeline records.
    pub fn pipelines_dir(&self) -> PathBuf {
        self.state_dir.join("pipelines")
    }

    /// Directory holding the local artifact index.
    pub fn registry_dir(&self) -> PathBuf {
        self.state_dir.join("registry")
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            namespace: self.namespace.clone(),
            dev_registry: self.dev_registry.clone(),
            max_parallel_builds: self.max_parallel_builds,
        }
    }

    pub fn oci_registry_config(&self) -> OciRegistryConfig {
        OciRegistryConfig {
            username: self.registry_username.clone(),
            password: self.registry_password.clone(),
            insecure_hosts: self.insecure_registries.clone(),
            timeout_secs: self.registry_timeout_secs,
        }
    }
}

fn parse_var<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = BerthConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.max_parallel_builds, DEFAULT_MAX_PARALLEL_BUILDS);
        assert_eq!(config.registry_backend, RegistryBackend::Oci);
        assert!(config.push);
        assert!(config.dev_registry.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = BerthConfig::from_lookup(lookup(&[
            ("BERTH_NAMESPACE", "team-a"),
            ("BERTH_STATE_DIR", "/var/lib/berth"),
            ("BERTH_DEV_REGISTRY", "registry.dev.local"),
            ("BERTH_REGISTRY_BACKEND", "local"),
            ("BERTH_INSECURE_REGISTRIES", "a:5000, b ,"),
            ("BERTH_MAX_PARALLEL_BUILDS", "8"),
            ("BERTH_PUSH", "FALSE"),
            ("BERTH_LOG_FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(config.namespace, "team-a");
        assert_eq!(config.pipelines_dir(), PathBuf::from("/var/lib/berth/pipelines"));
        assert_eq!(config.registry_backend, RegistryBackend::Local);
        assert_eq!(config.insecure_registries, vec!["a:5000", "b"]);
        assert!(!config.push);
        assert_eq!(config.log_format, LogFormat::Json);

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.max_parallel_builds, 8);
        assert_eq!(coordinator.dev_registry.as_deref(), Some("registry.dev.local"));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = BerthConfig::from_lookup(lookup(&[("BERTH_MAX_PARALLEL_BUILDS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("BERTH_MAX_PARALLEL_BUILDS"));

        assert!(BerthConfig::from_lookup(lookup(&[("BERTH_MAX_PARALLEL_BUILDS", "0")])).is_err());
    }
}
