//! Pipeline configuration.
//!
//! Loaded from YAML or JSON, e.g.
//!
//! ```yaml
//! hooks:
//!   beforeCommitTimeout: 2s
//!   afterCommitWarnAfter: 500ms
//!   maxConcurrentBatches: 32
//!   shutdownGracePeriod: 10s
//! retry:
//!   maxAttempts: 3
//!   backoff: 50ms
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::RetryPolicy;
use crate::{serde_dur, serde_dur_option};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse YAML config: {0}")]
	Yaml(#[from] serde_yaml::Error),

	#[error("failed to parse JSON config: {0}")]
	Json(#[from] serde_json::Error),

	#[error("invalid config: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineConfig {
	#[serde(default)]
	pub hooks: HookConfig,

	#[serde(default)]
	pub retry: RetryPolicy,
}

/// Settings for the hook chain and the after-commit dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HookConfig {
	/// Per-hook limit for before-commit hooks. Exceeding it fails the operation.
	#[serde(default, skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub before_commit_timeout: Option<Duration>,

	/// Log a warning when an after-commit hook runs longer than this.
	/// After-commit hooks are never cut short.
	#[serde(default, skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub after_commit_warn_after: Option<Duration>,

	/// Upper bound on after-commit batches running at the same time.
	#[serde(default = "default_max_concurrent_batches")]
	pub max_concurrent_batches: usize,

	/// How long shutdown waits for in-flight after-commit hooks.
	#[serde(default = "default_shutdown_grace_period", with = "serde_dur")]
	pub shutdown_grace_period: Duration,
}

fn default_max_concurrent_batches() -> usize {
	64
}

fn default_shutdown_grace_period() -> Duration {
	Duration::from_secs(30)
}

impl Default for HookConfig {
	fn default() -> Self {
		Self {
			before_commit_timeout: None,
			after_commit_warn_after: None,
			max_concurrent_batches: default_max_concurrent_batches(),
			shutdown_grace_period: default_shutdown_grace_period(),
		}
	}
}

impl PipelineConfig {
	pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
		let config: Self = serde_yaml::from_str(raw)?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
		let config: Self = serde_json::from_str(raw)?;
		config.validate()?;
		Ok(config)
	}

	/// Load from a file. `.json` files are parsed as JSON, anything else as YAML.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let raw = fs_err::read_to_string(path)?;
		match path.extension().and_then(|e| e.to_str()) {
			Some("json") => Self::from_json(&raw),
			_ => Self::from_yaml(&raw),
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.hooks.max_concurrent_batches == 0 {
			return Err(ConfigError::Invalid(
				"hooks.maxConcurrentBatches must be at least 1".to_string(),
			));
		}
		if self.hooks.before_commit_timeout == Some(Duration::ZERO) {
			return Err(ConfigError::Invalid(
				"hooks.beforeCommitTimeout must be greater than zero".to_string(),
			));
		}
		if self.retry.max_attempts == 0 {
			return Err(ConfigError::Invalid(
				"retry.maxAttempts must be at least 1".to_string(),
			));
		}
		Ok(())
	}
}
