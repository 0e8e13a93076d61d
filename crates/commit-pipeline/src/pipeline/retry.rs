use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_dur_option;

/// How [`Pipeline::run_with_retry`](super::Pipeline::run_with_retry) repeats
/// invocations that failed with a retryable error.
///
/// Every attempt is a complete, fresh invocation with its own transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicy {
	/// Total attempts, including the first. 1 disables retries.
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,

	/// Delay between attempts.
	#[serde(default, skip_serializing_if = "Option::is_none", with = "serde_dur_option")]
	pub backoff: Option<Duration>,
}

fn default_max_attempts() -> u32 {
	1
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: default_max_attempts(),
			backoff: None,
		}
	}
}

impl RetryPolicy {
	pub fn new(max_attempts: u32) -> Self {
		Self {
			max_attempts,
			backoff: None,
		}
	}

	pub fn with_backoff(mut self, backoff: Duration) -> Self {
		self.backoff = Some(backoff);
		self
	}

	/// Whether another attempt may follow attempt number `attempt` (1-based).
	pub fn allows_another(&self, attempt: u32) -> bool {
		attempt < self.max_attempts.max(1)
	}
}
