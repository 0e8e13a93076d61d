//! Log subscriber setup for binaries and tests embedding the pipeline.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive` (e.g.
/// `"commit_pipeline=debug"`). Returns false if a global subscriber was
/// already installed, which is harmless.
pub fn init(format: LogFormat, default_directive: &str) -> bool {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	match format {
		LogFormat::Text => builder.try_init().is_ok(),
		LogFormat::Json => builder.json().try_init().is_ok(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_log_format_names() {
		assert_eq!(serde_json::to_string(&LogFormat::Json).unwrap(), "\"json\"");
		assert_eq!(
			serde_json::from_str::<LogFormat>("\"text\"").unwrap(),
			LogFormat::Text
		);
	}

	#[test]
	fn test_second_init_is_harmless() {
		init(LogFormat::Text, "warn");
		assert!(!init(LogFormat::Json, "warn"));
	}
}
