//! Tuner configuration, loaded from TOML.
//!
//! Every field has a default so a config file only needs to name what it
//! changes. Thresholds, including the mutation bounds, are also exposed
//! through [`ThresholdsHandle`] so a retraining process can adjust them
//! between loop iterations.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mutator::{MutationError, MutationPolicy};

pub const ENV_BOT_TOKEN: &str = "SIGNALTUNE_BOT_TOKEN";
pub const ENV_CHAT_ID: &str = "SIGNALTUNE_CHAT_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid mutation policy: {0}")]
    Mutation(#[from] MutationError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Master seed for mutation and schedule randomness.
    pub seed: u64,
    pub paths: PathsConfig,
    pub thresholds: Thresholds,
    pub mutation: MutationConfig,
    pub evaluator: EvaluatorConfig,
    pub notifier: NotifierConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            paths: PathsConfig::default(),
            thresholds: Thresholds::default(),
            mutation: MutationConfig::default(),
            evaluator: EvaluatorConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl TunerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: TunerConfig = toml::from_str(text)?;
        config.notifier.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        self.mutation.validate()?;
        if self.evaluator.program.trim().is_empty() {
            return Err(ConfigError::Invalid("evaluator.program is empty".into()));
        }
        if self.evaluator.timeout_secs == 0 {
            return Err(ConfigError::Invalid("evaluator.timeout_secs must be > 0".into()));
        }
        self.notifier.validate()
    }
}

/// Artifact locations. Relative entries resolve against `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: PathBuf,
    pub production: PathBuf,
    pub draft: PathBuf,
    pub versions_dir: PathBuf,
    pub metrics: PathBuf,
    pub learning_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            production: PathBuf::from("strategy.toml"),
            draft: PathBuf::from("strategy_draft.toml"),
            versions_dir: PathBuf::from("code_versions"),
            metrics: PathBuf::from("current_metrics.json"),
            learning_log: PathBuf::from("learning_log.jsonl"),
        }
    }
}

impl PathsConfig {
    /// Paths rooted at `root`, default file names.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn production_path(&self) -> PathBuf {
        self.resolve(&self.production)
    }

    pub fn draft_path(&self) -> PathBuf {
        self.resolve(&self.draft)
    }

    pub fn versions_path(&self) -> PathBuf {
        self.resolve(&self.versions_dir)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.resolve(&self.metrics)
    }

    pub fn learning_log_path(&self) -> PathBuf {
        self.resolve(&self.learning_log)
    }
}

/// Loop thresholds, timing and mutation bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Minimum accuracy gain for promotion without human approval.
    pub auto_promote_min_gain: f64,
    pub poll_interval_secs: u64,
    /// Pause after a failed iteration before retrying.
    pub recovery_interval_secs: u64,
    /// Pending approvals older than this expire. `None` keeps them forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_ttl_secs: Option<u64>,
    /// Per-class deltas, floors and ceilings used by the mutator.
    pub mutation_bounds: MutationPolicy,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_promote_min_gain: 0.02,
            poll_interval_secs: 10,
            recovery_interval_secs: 10,
            approval_ttl_secs: None,
            mutation_bounds: MutationPolicy::default(),
        }
    }
}

impl Thresholds {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn approval_ttl(&self) -> Option<chrono::Duration> {
        self.approval_ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.auto_promote_min_gain.is_finite() {
            return Err(ConfigError::Invalid(
                "thresholds.auto_promote_min_gain must be finite".into(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "thresholds.poll_interval_secs must be > 0".into(),
            ));
        }
        Ok(self.mutation_bounds.validate()?)
    }
}

/// Draft generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub enabled: bool,
    /// Re-mutate once this many seconds passed since the last mutation.
    pub min_interval_secs: u64,
    /// Chance per tick of mutating anyway.
    pub explore_probability: f64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: 3600,
            explore_probability: 0.05,
        }
    }
}

impl MutationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.explore_probability) {
            return Err(ConfigError::Invalid(format!(
                "mutation.explore_probability {} is outside [0, 1]",
                self.explore_probability
            )));
        }
        Ok(())
    }
}

/// External sandbox command. The draft path is appended to `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            program: "python3".into(),
            args: vec!["sandbox_runner.py".into()],
            timeout_secs: 120,
        }
    }
}

impl EvaluatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// Messages go to the log only.
    Log,
    /// Bot-style HTTP API (`<api_base>/bot<token>/sendMessage`).
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    pub api_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::Log,
            api_base: "https://api.telegram.org".into(),
            bot_token: None,
            chat_id: None,
            timeout_secs: 10,
        }
    }
}

impl NotifierConfig {
    /// Secrets from the environment take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(ENV_BOT_TOKEN) {
            if !token.is_empty() {
                self.bot_token = Some(token);
            }
        }
        if let Ok(chat) = std::env::var(ENV_CHAT_ID) {
            if !chat.is_empty() {
                self.chat_id = Some(chat);
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == NotifierKind::Http && (self.bot_token.is_none() || self.chat_id.is_none()) {
            return Err(ConfigError::Invalid(format!(
                "http notifier needs bot_token and chat_id (or {ENV_BOT_TOKEN}/{ENV_CHAT_ID})"
            )));
        }
        Ok(())
    }
}

/// Process-wide thresholds, readable by the loop and adjustable from outside.
#[derive(Debug, Clone, Default)]
pub struct ThresholdsHandle(Arc<RwLock<Thresholds>>);

impl ThresholdsHandle {
    pub fn new(thresholds: Thresholds) -> Self {
        Self(Arc::new(RwLock::new(thresholds)))
    }

    pub fn snapshot(&self) -> Thresholds {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Thresholds)) {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = TunerConfig::from_toml_str("").unwrap();
        assert_eq!(config.thresholds.auto_promote_min_gain, 0.02);
        assert_eq!(config.thresholds.poll_interval_secs, 10);
        assert_eq!(config.paths.production, PathBuf::from("strategy.toml"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let text = r#"
seed = 7

[thresholds]
auto_promote_min_gain = 0.05

[thresholds.mutation_bounds.window]
deltas = [-1, 1]
floor = 3
"#;
        let config = TunerConfig::from_toml_str(text).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.thresholds.auto_promote_min_gain, 0.05);
        assert_eq!(config.thresholds.recovery_interval_secs, 10);
        assert_eq!(config.thresholds.mutation_bounds.window.floor, 3);
        assert_eq!(config.thresholds.mutation_bounds.threshold.floor, 5);
    }

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = TunerConfig::default();
        let text = config.to_toml_string().unwrap();
        let back: TunerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(TunerConfig::from_toml_str("[thresholds]\npoll_interval_secs = 0\n").is_err());
        assert!(TunerConfig::from_toml_str("[mutation]\nexplore_probability = 1.5\n").is_err());
        assert!(TunerConfig::from_toml_str("[thresholds.mutation_bounds.threshold]\ndeltas = []\nfloor = 1\n").is_err());
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let paths = PathsConfig::under("/srv/tuner");
        assert_eq!(paths.production_path(), PathBuf::from("/srv/tuner/strategy.toml"));
        assert_eq!(paths.versions_path(), PathBuf::from("/srv/tuner/code_versions"));
    }

    #[test]
    fn thresholds_handle_sees_updates() {
        let handle = ThresholdsHandle::new(Thresholds::default());
        let other = handle.clone();
        other.update(|t| {
            t.auto_promote_min_gain = 0.01;
            t.mutation_bounds.threshold.ceiling = Some(80);
        });
        let seen = handle.snapshot();
        assert_eq!(seen.auto_promote_min_gain, 0.01);
        assert_eq!(seen.mutation_bounds.threshold.ceiling, Some(80));
    }
}
