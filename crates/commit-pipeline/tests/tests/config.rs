// Loading pipeline configuration from disk and applying it

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commit_pipeline::store::memory::MemoryStorage;
use commit_pipeline::telemetry::{self, LogFormat};
use commit_pipeline::{
	BeforeCommitContext, BeforeCommitHook, Entity, ErrorKind, HookError, HookRegistry, MergePatch,
	OperationContext, Pipeline, PipelineConfig,
};
use serde_json::json;
use tempfile::NamedTempFile;

struct Slow;

#[async_trait]
impl BeforeCommitHook for Slow {
	async fn before_commit(&self, _ctx: &mut BeforeCommitContext<'_>) -> Result<(), HookError> {
		tokio::time::sleep(Duration::from_secs(30)).await;
		Ok(())
	}
}

fn write_config(suffix: &str, body: &str) -> anyhow::Result<NamedTempFile> {
	let file = NamedTempFile::with_suffix(suffix)?;
	std::fs::write(file.path(), body)?;
	Ok(file)
}

#[tokio::test(start_paused = true)]
async fn test_yaml_config_drives_the_pipeline() -> anyhow::Result<()> {
	telemetry::init(LogFormat::Text, "commit_pipeline=debug");

	let file = write_config(
		".yaml",
		r#"
hooks:
  beforeCommitTimeout: 250ms
  maxConcurrentBatches: 4
retry:
  maxAttempts: 2
  backoff: 10ms
"#,
	)?;
	let config = PipelineConfig::from_file(file.path())?;
	assert_eq!(config.hooks.before_commit_timeout, Some(Duration::from_millis(250)));
	assert_eq!(config.retry.max_attempts, 2);

	let store = MemoryStorage::new();
	let user = store.seed(Entity::new("user", "u1", json!({ "email": "old@example.com" })));
	let mut hooks = HookRegistry::builder();
	hooks.before_commit("user", "slow", Slow)?;
	let pipeline = Pipeline::new(Arc::new(store.clone()), Arc::new(hooks.build()), &config);
	assert_eq!(pipeline.retry_policy(), &config.retry);

	let outcome = pipeline
		.run(
			OperationContext::new("user", json!({ "email": "new@example.com" })).with_entity(user),
			&MergePatch::new(),
		)
		.await;

	let failure = outcome.into_result().unwrap_err();
	assert_eq!(failure.kind, ErrorKind::HookFailed);
	assert_eq!(failure.hook.as_deref(), Some("slow"));
	assert!(failure.message.contains("timed out"), "{}", failure.message);
	assert_eq!(
		store.committed(&"user".into(), "u1").map(|u| u.attributes["email"].clone()),
		Some(json!("old@example.com"))
	);
	Ok(())
}

#[test]
fn test_json_config_file() -> anyhow::Result<()> {
	let file = write_config(".json", r#"{ "hooks": { "shutdownGracePeriod": "5s" } }"#)?;
	let config = PipelineConfig::from_file(file.path())?;
	assert_eq!(config.hooks.shutdown_grace_period, Duration::from_secs(5));
	assert_eq!(config.hooks.max_concurrent_batches, 64);
	Ok(())
}

#[test]
fn test_invalid_config_file() -> anyhow::Result<()> {
	let file = write_config(".yaml", "retry:\n  maxAttempts: 0\n")?;
	let err = PipelineConfig::from_file(file.path()).unwrap_err();
	assert!(err.to_string().contains("maxAttempts"), "{err}");
	Ok(())
}
