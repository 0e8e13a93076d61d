//! A transactional mutation pipeline.
//!
//! Write operations against a backing store run through a fixed sequence:
//! the mutation executes inside a transaction, registered before-commit hooks
//! inspect (and may veto or amend) the change, the transaction commits, and
//! after-commit hooks observe the committed result in the background. Every
//! failure before the commit rolls the transaction back.
//!
//! ```ignore
//! let mut hooks = HookRegistry::builder();
//! hooks
//! 	.before_commit("user", "unique-email", UniqueEmail)?
//! 	.after_commit("user", "send-welcome", SendWelcome)?;
//!
//! let pipeline = Pipeline::new(storage, Arc::new(hooks.build()), &PipelineConfig::default());
//! let outcome = pipeline.run(OperationContext::new("user", payload).with_entity(user), &PersistEntity).await;
//! ```

pub mod config;
pub mod context;
pub mod hooks;
pub mod mutation;
pub mod pipeline;
pub mod store;
pub mod telemetry;
pub mod transaction;

pub use config::{ConfigError, HookConfig, PipelineConfig};
pub use context::{Actor, CommittedEvent, Entity, EntityKind, OperationContext};
pub use hooks::{
	AfterCommitHook, BeforeCommitContext, BeforeCommitHook, HookError, HookRegistry, Phase,
};
pub use mutation::{FnMutation, MergePatch, Mutation, MutationError, PersistEntity};
pub use pipeline::{ErrorKind, Failure, Outcome, Pipeline, PipelineError, RetryPolicy};
pub use store::{Storage, StorageTx, StoreError};
pub use transaction::{Transaction, TransactionError, TxState};

/// Serde helpers for `Duration` fields written as Go-style strings (`"1m30s"`).
pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer, de};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&durationfmt::to_string(*duration))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(deserializer)?;
		parse(&raw).map_err(de::Error::custom)
	}

	pub(crate) fn parse(raw: &str) -> Result<Duration, String> {
		let nanos = go_parse_duration::parse_duration(raw.trim())
			.map_err(|e| format!("invalid duration {raw:?}: {e:?}"))?;
		let nanos = u64::try_from(nanos).map_err(|_| format!("duration {raw:?} must not be negative"))?;
		Ok(Duration::from_nanos(nanos))
	}
}

/// Like [`serde_dur`], for `Option<Duration>` fields.
pub mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer, de};

	pub fn serialize<S: Serializer>(
		duration: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match duration {
			Some(d) => serializer.serialize_some(&durationfmt::to_string(*d)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		Option::<String>::deserialize(deserializer)?
			.map(|raw| super::serde_dur::parse(&raw))
			.transpose()
			.map_err(de::Error::custom)
	}
}
