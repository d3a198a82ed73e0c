//! Layered configuration for anvil.
//!
//! Values are resolved in this order, later layers winning:
//! 1. built-in defaults
//! 2. `.anvil/anvil.toml` (or the file passed with `--config`)
//! 3. `ANVIL_*` environment variables (a dotenv secrets file is loaded first)
//! 4. CLI flags, applied by the command handlers
//!
//! # Configuration File Format
//!
//! ```toml
//! artifacts_dir = "artifacts"
//!
//! [pipeline]
//! timeout_secs = 120
//! retries = 3
//! allow_network = false
//! poll_attempts = 10
//! poll_interval_ms = 100
//!
//! [planner]
//! base_url = "https://api.groq.com/openai/v1"
//! model = "llama-3.3-70b-versatile"
//! api_key_env = "GROQ_API_KEY"
//! temperature = 0.2
//! request_timeout_secs = 120
//!
//! [generator]
//! base_url = "http://localhost:1234/v1"
//! model = "local-model"
//! read_timeout_secs = 60
//!
//! [sandbox]
//! image = "python:3.12-slim"
//! memory = "512m"
//!
//! [logging]
//! file = ".anvil/logs/anvil.log"
//! format = "text"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anvil_common::{DEFAULT_RETRIES_PER_STAGE, DEFAULT_TIMEOUT_SECS};
use anyhow::{Context, Result};
use serde::Deserialize;

use crate::pipeline::{CoordinatorSettings, DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL};
use crate::retry::DEFAULT_BASE_DELAY;
use crate::sandbox::{SandboxConfig, SandboxSection};
use crate::stages::ChatTimeouts;

pub const CONFIG_DIR: &str = ".anvil";
pub const CONFIG_FILE: &str = "anvil.toml";
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
/// Secrets file loaded into the process environment when present.
pub const ENV_FILE_VAR: &str = "ANVIL_ENV_FILE";

pub const DEFAULT_PLANNER_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_PLANNER_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_PLANNER_KEY_ENV: &str = "GROQ_API_KEY";
pub const DEFAULT_GENERATOR_URL: &str = "http://localhost:1234/v1";
pub const DEFAULT_GENERATOR_MODEL: &str = "local-model";
pub const DEFAULT_GENERATOR_KEY_ENV: &str = "LM_STUDIO_API_KEY";
/// LM Studio accepts any bearer token.
pub const DEFAULT_GENERATOR_KEY: &str = "lm-studio";

/// `[pipeline]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSection {
    pub timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub allow_network: Option<bool>,
    pub poll_attempts: Option<u32>,
    pub poll_interval_ms: Option<u64>,
}

/// `[planner]` / `[generator]` tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSection {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    /// Limit on a non-streamed completion.
    pub request_timeout_secs: Option<u64>,
    /// Longest silence tolerated while reading a response or stream.
    pub read_timeout_secs: Option<u64>,
}

/// `[logging]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSection {
    pub file: Option<PathBuf>,
    pub format: Option<String>,
}

/// Raw contents of `anvil.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnvilToml {
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub planner: EndpointSection,
    #[serde(default)]
    pub generator: EndpointSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AnvilToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse anvil.toml")
    }

    /// Load `.anvil/anvil.toml` under `project_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// A model endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token.
    pub api_key_env: String,
    pub temperature: f32,
    /// Token used when `api_key_env` is unset.
    pub fallback_key: Option<String>,
    pub timeouts: ChatTimeouts,
}

impl EndpointConfig {
    fn planner_default() -> Self {
        Self {
            base_url: DEFAULT_PLANNER_URL.to_string(),
            model: DEFAULT_PLANNER_MODEL.to_string(),
            api_key_env: DEFAULT_PLANNER_KEY_ENV.to_string(),
            temperature: crate::stages::planner::DEFAULT_PLANNER_TEMPERATURE,
            fallback_key: None,
            timeouts: ChatTimeouts::default(),
        }
    }

    fn generator_default() -> Self {
        Self {
            base_url: DEFAULT_GENERATOR_URL.to_string(),
            model: DEFAULT_GENERATOR_MODEL.to_string(),
            api_key_env: DEFAULT_GENERATOR_KEY_ENV.to_string(),
            temperature: crate::stages::generator::DEFAULT_GENERATOR_TEMPERATURE,
            fallback_key: Some(DEFAULT_GENERATOR_KEY.to_string()),
            timeouts: ChatTimeouts::default(),
        }
    }

    fn apply(&mut self, section: &EndpointSection) {
        if let Some(ref url) = section.base_url {
            self.base_url = url.clone();
        }
        if let Some(ref model) = section.model {
            self.model = model.clone();
        }
        if let Some(ref env) = section.api_key_env {
            self.api_key_env = env.clone();
        }
        if let Some(temperature) = section.temperature {
            self.temperature = temperature;
        }
        if let Some(secs) = section.request_timeout_secs {
            self.timeouts.request = Duration::from_secs(secs);
        }
        if let Some(secs) = section.read_timeout_secs {
            self.timeouts.read = Duration::from_secs(secs);
        }
    }

    /// Resolve the bearer token from the environment, then the fallback.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_with(|key| std::env::var(key).ok())
    }

    pub fn api_key_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        lookup(&self.api_key_env)
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.fallback_key.clone())
    }
}

/// Resolved pipeline defaults; CLI flags override per run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    pub allow_network: bool,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES_PER_STAGE,
            allow_network: false,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoggingConfig {
    pub file: Option<PathBuf>,
    pub format: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct AnvilConfig {
    pub project_dir: PathBuf,
    /// Config file that was read, if any.
    pub source: Option<PathBuf>,
    pub artifacts_dir: PathBuf,
    pub pipeline: PipelineConfig,
    pub planner: EndpointConfig,
    pub generator: EndpointConfig,
    pub sandbox: SandboxConfig,
    pub logging: LoggingConfig,
}

impl AnvilConfig {
    /// Defaults only; nothing read from disk or the environment.
    pub fn defaults(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            artifacts_dir: project_dir.join(DEFAULT_ARTIFACTS_DIR),
            project_dir,
            source: None,
            pipeline: PipelineConfig::default(),
            planner: EndpointConfig::planner_default(),
            generator: EndpointConfig::generator_default(),
            sandbox: SandboxConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Resolve the file and environment layers for `project_dir`.
    ///
    /// An explicit config path must exist; the implicit `.anvil/anvil.toml` is optional.
    pub fn load(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let (toml, source) = match explicit {
            Some(path) => (AnvilToml::load(path)?, Some(path.to_path_buf())),
            None => {
                let path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
                let source = path.exists().then_some(path);
                (AnvilToml::load_or_default(project_dir)?, source)
            }
        };
        let mut config = Self::defaults(project_dir);
        config.source = source;
        config.apply_toml(toml);
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_toml(&mut self, toml: AnvilToml) {
        if let Some(dir) = toml.artifacts_dir {
            self.artifacts_dir = self.resolve_path(dir);
        }
        let p = &toml.pipeline;
        if let Some(timeout) = p.timeout_secs {
            self.pipeline.timeout_secs = timeout;
        }
        if let Some(retries) = p.retries {
            self.pipeline.retries = retries;
        }
        if let Some(allow) = p.allow_network {
            self.pipeline.allow_network = allow;
        }
        if let Some(attempts) = p.poll_attempts {
            self.pipeline.poll_attempts = attempts;
        }
        if let Some(ms) = p.poll_interval_ms {
            self.pipeline.poll_interval = Duration::from_millis(ms);
        }
        self.planner.apply(&toml.planner);
        self.generator.apply(&toml.generator);
        self.sandbox.apply(toml.sandbox);
        if let Some(file) = toml.logging.file {
            self.logging.file = Some(self.resolve_path(file));
        }
        if toml.logging.format.is_some() {
            self.logging.format = toml.logging.format;
        }
    }

    /// Apply `ANVIL_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("ANVIL_ARTIFACTS_DIR") {
            self.artifacts_dir = self.resolve_path(PathBuf::from(dir));
        }
        if let Some(url) = lookup("ANVIL_PLANNER_URL") {
            self.planner.base_url = url;
        }
        if let Some(model) = lookup("ANVIL_PLANNER_MODEL") {
            self.planner.model = model;
        }
        if let Some(url) = lookup("ANVIL_GENERATOR_URL") {
            self.generator.base_url = url;
        }
        if let Some(model) = lookup("ANVIL_GENERATOR_MODEL") {
            self.generator.model = model;
        }
        if let Some(image) = lookup("ANVIL_SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(timeout) = lookup("ANVIL_TIMEOUT") {
            self.pipeline.timeout_secs = timeout
                .trim()
                .parse()
                .with_context(|| format!("ANVIL_TIMEOUT must be a number of seconds, got '{}'", timeout))?;
        }
        if let Some(retries) = lookup("ANVIL_RETRIES") {
            self.pipeline.retries = retries
                .trim()
                .parse()
                .with_context(|| format!("ANVIL_RETRIES must be a positive integer, got '{}'", retries))?;
        }
        if let Some(allow) = lookup("ANVIL_ALLOW_NETWORK") {
            self.pipeline.allow_network = parse_bool(&allow)
                .with_context(|| format!("ANVIL_ALLOW_NETWORK must be true or false, got '{}'", allow))?;
        }
        Ok(())
    }

    fn resolve_path(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            base_delay: DEFAULT_BASE_DELAY,
            poll_attempts: self.pipeline.poll_attempts,
            poll_interval: self.pipeline.poll_interval,
        }
    }

    /// Non-fatal problems worth reporting before a run.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.pipeline.timeout_secs == 0 {
            warnings.push("pipeline.timeout_secs is 0; runs will be rejected".to_string());
        }
        if self.pipeline.retries == 0 {
            warnings.push("pipeline.retries is 0; runs will be rejected".to_string());
        }
        for (name, endpoint) in [("planner", &self.planner), ("generator", &self.generator)] {
            if endpoint.timeouts.request.is_zero() || endpoint.timeouts.read.is_zero() {
                warnings.push(format!(
                    "{} timeouts must be at least 1s; every request will time out",
                    name
                ));
            }
        }
        if self.planner.api_key().is_none() {
            warnings.push(format!(
                "{} is not set; planning requests will fail",
                self.planner.api_key_env
            ));
        }
        warnings.extend(self.sandbox.validate());
        warnings
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a boolean: {}", other),
    }
}

/// Default location of the secrets file: `~/.config/anvil/.env`.
pub fn default_env_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("anvil").join(".env"))
}

/// Load the dotenv secrets file into the process environment.
///
/// Variables that are already set are left untouched. Returns the file that
/// was loaded, if any. Must run before any threads are spawned.
pub fn load_secrets_file() -> Result<Option<PathBuf>> {
    let path = match std::env::var(ENV_FILE_VAR) {
        Ok(explicit) => PathBuf::from(explicit),
        Err(_) => match default_env_file() {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };
    dotenvy::from_path(&path)
        .with_context(|| format!("Failed to load environment file: {}", path.display()))?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AnvilConfig::defaults("/work");
        assert_eq!(config.artifacts_dir, PathBuf::from("/work/artifacts"));
        assert_eq!(config.pipeline.timeout_secs, 120);
        assert_eq!(config.pipeline.retries, 3);
        assert!(!config.pipeline.allow_network);
        assert_eq!(config.planner.model, "llama-3.3-70b-versatile");
        assert_eq!(config.generator.base_url, "http://localhost:1234/v1");
        assert_eq!(config.sandbox.image, "python:3.12-slim");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let toml = AnvilToml::load_or_default(dir.path()).unwrap();
        assert!(toml.artifacts_dir.is_none());
        assert!(toml.pipeline.timeout_secs.is_none());
    }

    #[test]
    fn test_toml_layer_overrides_defaults() {
        let toml = AnvilToml::parse(
            r#"
artifacts_dir = "out"

[pipeline]
timeout_secs = 30
retries = 5
allow_network = true
poll_interval_ms = 250

[planner]
model = "llama-3.1-8b-instant"
request_timeout_secs = 20

[generator]
base_url = "http://10.0.0.2:1234/v1"
temperature = 0.3
read_timeout_secs = 90

[sandbox]
image = "v4-sandbox"

[logging]
file = "logs/anvil.log"
format = "json"
"#,
        )
        .unwrap();
        let mut config = AnvilConfig::defaults("/work");
        config.apply_toml(toml);

        assert_eq!(config.artifacts_dir, PathBuf::from("/work/out"));
        assert_eq!(config.pipeline.timeout_secs, 30);
        assert_eq!(config.pipeline.retries, 5);
        assert!(config.pipeline.allow_network);
        assert_eq!(config.pipeline.poll_interval, Duration::from_millis(250));
        assert_eq!(config.pipeline.poll_attempts, 10); // default
        assert_eq!(config.planner.model, "llama-3.1-8b-instant");
        assert_eq!(config.planner.base_url, DEFAULT_PLANNER_URL); // default
        assert_eq!(config.generator.base_url, "http://10.0.0.2:1234/v1");
        assert_eq!(config.generator.temperature, 0.3);
        assert_eq!(config.planner.timeouts.request, Duration::from_secs(20));
        assert_eq!(config.planner.timeouts.read, ChatTimeouts::default().read);
        assert_eq!(config.generator.timeouts.read, Duration::from_secs(90));
        assert_eq!(config.sandbox.image, "v4-sandbox");
        assert_eq!(config.logging.file, Some(PathBuf::from("/work/logs/anvil.log")));
        assert_eq!(config.logging.format.as_deref(), Some("json"));
    }

    #[test]
    fn test_env_layer_overrides_toml() {
        let mut config = AnvilConfig::defaults("/work");
        config.apply_toml(AnvilToml::parse("[pipeline]\ntimeout_secs = 30\n").unwrap());
        config
            .apply_env(env(&[
                ("ANVIL_TIMEOUT", "45"),
                ("ANVIL_RETRIES", "2"),
                ("ANVIL_ALLOW_NETWORK", "yes"),
                ("ANVIL_ARTIFACTS_DIR", "/abs/artifacts"),
                ("ANVIL_GENERATOR_MODEL", "qwen2.5-coder"),
                ("ANVIL_SANDBOX_IMAGE", "python:3.13-slim"),
            ]))
            .unwrap();
        assert_eq!(config.pipeline.timeout_secs, 45);
        assert_eq!(config.pipeline.retries, 2);
        assert!(config.pipeline.allow_network);
        assert_eq!(config.artifacts_dir, PathBuf::from("/abs/artifacts"));
        assert_eq!(config.generator.model, "qwen2.5-coder");
        assert_eq!(config.sandbox.image, "python:3.13-slim");
    }

    #[test]
    fn test_env_layer_rejects_bad_numbers() {
        let mut config = AnvilConfig::defaults("/work");
        let err = config
            .apply_env(env(&[("ANVIL_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("ANVIL_TIMEOUT"));
    }

    #[test]
    fn test_load_reads_project_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            "[sandbox]\nmemory = \"1g\"\n",
        )
        .unwrap();
        let config = AnvilConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.sandbox.memory, "1g");
        assert!(config.source.is_some());
    }

    #[test]
    fn test_load_explicit_missing_file_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = AnvilConfig::load(dir.path(), Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_invalid_toml_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[pipeline\ntimeout_secs = ").unwrap();
        assert!(AnvilConfig::load(dir.path(), Some(&path)).is_err());
    }

    #[test]
    fn test_api_key_resolution() {
        let planner = EndpointConfig::planner_default();
        assert_eq!(planner.api_key_with(env(&[])), None);
        assert_eq!(
            planner.api_key_with(env(&[("GROQ_API_KEY", "gsk_123")])),
            Some("gsk_123".to_string())
        );
        let generator = EndpointConfig::generator_default();
        assert_eq!(generator.api_key_with(env(&[])), Some("lm-studio".to_string()));
        assert_eq!(
            generator.api_key_with(env(&[("LM_STUDIO_API_KEY", " ")])),
            Some("lm-studio".to_string())
        );
    }

    #[test]
    fn test_coordinator_settings_follow_pipeline() {
        let mut config = AnvilConfig::defaults("/work");
        config.pipeline.poll_attempts = 3;
        let settings = config.coordinator_settings();
        assert_eq!(settings.poll_attempts, 3);
        assert_eq!(settings.base_delay, DEFAULT_BASE_DELAY);
    }

    #[test]
    fn test_validate_warns_about_zero_timeouts() {
        let mut config = AnvilConfig::defaults("/work");
        config.apply_toml(AnvilToml::parse("[generator]\nread_timeout_secs = 0\n").unwrap());
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.starts_with("generator timeouts")));
        assert!(!warnings.iter().any(|w| w.starts_with("planner timeouts")));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
