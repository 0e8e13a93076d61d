// End-to-end tests driving the pipeline through its public API

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use commit_pipeline::store::memory::MemoryStorage;
use commit_pipeline::{
	Actor, AfterCommitHook, BeforeCommitContext, BeforeCommitHook, CommittedEvent, Entity,
	EntityKind, ErrorKind, FnMutation, HookError, HookRegistry, MergePatch, MutationError,
	OperationContext, Pipeline, PipelineConfig, PipelineError, RetryPolicy,
};
use serde_json::{Value, json};

/// Rejects an email that another user already has.
struct UniqueEmail;

#[async_trait]
impl BeforeCommitHook for UniqueEmail {
	async fn before_commit(&self, ctx: &mut BeforeCommitContext<'_>) -> Result<(), HookError> {
		let Some(email) = ctx.entity().and_then(|u| u.attr("email")).cloned() else {
			return Ok(());
		};
		let index = EntityKind::new("email_index");
		let key = email.as_str().unwrap_or_default().to_string();
		let owner = ctx.entity().map(|u| u.id.clone()).unwrap_or_default();
		match ctx.get(&index, &key).await? {
			Some(entry) if entry.attr("owner") != Some(&json!(owner)) => {
				Err(HookError::rejected("duplicate-email"))
			},
			Some(_) => Ok(()),
			None => {
				ctx.persist(&Entity::new(index, key, json!({ "owner": owner })))
					.await?;
				Ok(())
			},
		}
	}
}

/// Remembers every committed event it observes.
#[derive(Default)]
struct Outbox {
	events: Mutex<Vec<CommittedEvent>>,
}

#[async_trait]
impl AfterCommitHook for Outbox {
	async fn after_commit(&self, event: &CommittedEvent) -> Result<(), HookError> {
		self.events.lock().unwrap().push(event.clone());
		Ok(())
	}
}

fn load(store: &MemoryStorage, id: &str, payload: Value) -> OperationContext {
	let user = store
		.committed(&EntityKind::new("user"), id)
		.unwrap_or_else(|| Entity::new("user", id, json!({})));
	OperationContext::new("user", payload)
		.with_entity(user)
		.with_actor(Actor::new(id).with_role("member"))
}

#[tokio::test]
async fn test_unique_email_across_users() -> anyhow::Result<()> {
	let store = MemoryStorage::new();
	store.seed(Entity::new("user", "alice", json!({})));
	store.seed(Entity::new("user", "bob", json!({})));

	let outbox = Arc::new(Outbox::default());
	let mut hooks = HookRegistry::builder();
	hooks
		.before_commit("user", "unique-email", UniqueEmail)?
		.after_commit_arc("user", "outbox", outbox.clone())?;
	let pipeline = Pipeline::new(
		Arc::new(store.clone()),
		Arc::new(hooks.build()),
		&PipelineConfig::default(),
	);
	let patch = MergePatch::new().require("email");

	let outcome = pipeline
		.run(load(&store, "alice", json!({ "email": "a@example.com" })), &patch)
		.await;
	assert!(outcome.is_success(), "{outcome:?}");

	let outcome = pipeline
		.run(load(&store, "bob", json!({ "email": "a@example.com" })), &patch)
		.await;
	let failure = outcome.into_result().unwrap_err();
	assert_eq!(failure.kind, ErrorKind::HookRejected);
	assert_eq!(failure.message, "duplicate-email");

	// Re-saving alice with her own address is fine
	let outcome = pipeline
		.run(load(&store, "alice", json!({ "email": "a@example.com", "name": "Alice" })), &patch)
		.await;
	assert!(outcome.is_success());

	pipeline.dispatcher().wait_idle().await;
	let events = outbox.events.lock().unwrap();
	assert_eq!(events.len(), 2);
	assert_eq!(events[1].payload["name"], "Alice");
	assert_eq!(events[1].actor.as_ref().map(|a| a.id.as_str()), Some("alice"));
	assert_eq!(
		events[1].original.as_ref().map(|u| u.attributes.clone()),
		Some(json!({ "email": "a@example.com" }))
	);
	assert_eq!(events[1].entity.as_ref().map(|u| u.version), Some(3));
	assert!(
		store
			.committed(&EntityKind::new("user"), "bob")
			.is_some_and(|u| u.attr("email").is_none())
	);
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_do_not_lose_updates() -> anyhow::Result<()> {
	const WRITERS: usize = 16;

	let store = MemoryStorage::new();
	store.seed(Entity::new("counter", "visits", json!({ "value": 0 })));
	let config = PipelineConfig {
		retry: RetryPolicy::new(100),
		..PipelineConfig::default()
	};
	let pipeline = Pipeline::new(Arc::new(store.clone()), Arc::new(HookRegistry::empty()), &config);

	let increment = Arc::new(FnMutation::new("increment", |ctx, tx| {
		Box::pin(async move {
			let mut counter = ctx
				.entity()
				.cloned()
				.ok_or_else(|| MutationError::validation("no counter"))?;
			let value = counter.attr("value").and_then(Value::as_u64).unwrap_or_default();
			counter.set_attr("value", json!(value + 1));
			let staged = tx.persist(&counter).await?;
			ctx.set_entity(staged);
			Ok(json!(value + 1))
		})
	}));

	let mut tasks = Vec::new();
	for _ in 0..WRITERS {
		let pipeline = pipeline.clone();
		let store = store.clone();
		let increment = increment.clone();
		tasks.push(tokio::spawn(async move {
			pipeline
				.run_with_retry(
					|_| {
						let counter = store.committed(&EntityKind::new("counter"), "visits");
						async move {
							let counter = counter
								.ok_or_else(|| PipelineError::Internal("counter missing".to_string()))?;
							Ok::<_, PipelineError>(
								OperationContext::new("counter", Value::Null).with_entity(counter),
							)
						}
					},
					increment.as_ref(),
				)
				.await
		}));
	}

	for task in tasks {
		let outcome = task.await?;
		assert!(outcome.is_success(), "{outcome:?}");
	}

	let counter = store
		.committed(&EntityKind::new("counter"), "visits")
		.expect("counter exists");
	assert_eq!(counter.attributes["value"], WRITERS as u64);
	assert_eq!(store.commit_count(), WRITERS as u64);
	Ok(())
}

#[tokio::test]
async fn test_shutdown_drops_later_after_commit_hooks() -> anyhow::Result<()> {
	let store = MemoryStorage::new();
	store.seed(Entity::new("user", "alice", json!({})));
	let outbox = Arc::new(Outbox::default());
	let mut hooks = HookRegistry::builder();
	hooks.after_commit_arc("user", "outbox", outbox.clone())?;
	let pipeline = Pipeline::new(
		Arc::new(store.clone()),
		Arc::new(hooks.build()),
		&PipelineConfig::default(),
	);

	let outcome = pipeline
		.run(load(&store, "alice", json!({ "email": "a@example.com" })), &MergePatch::new())
		.await;
	assert!(outcome.is_success());

	let report = pipeline.shutdown().await;
	assert!(report.drained);
	assert_eq!(outbox.events.lock().unwrap().len(), 1);

	// Commits still go through, but nothing observes them anymore
	let outcome = pipeline
		.run(load(&store, "alice", json!({ "email": "b@example.com" })), &MergePatch::new())
		.await;
	assert!(outcome.is_success());
	assert_eq!(pipeline.dispatcher().stats().batches_dropped, 1);
	assert_eq!(outbox.events.lock().unwrap().len(), 1);
	Ok(())
}
