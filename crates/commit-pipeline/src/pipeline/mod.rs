//! The transactional mutation pipeline.
//!
//! Every invocation runs the same fixed sequence:
//!
//! 1. begin a transaction
//! 2. apply the mutation inside it
//! 3. run the before-commit hooks for the entity kind, any of which may veto
//! 4. commit
//! 5. hand the after-commit hooks to the background dispatcher
//!
//! Any failure in steps 2-4 rolls the transaction back, so nothing the
//! invocation staged becomes visible. The caller's outcome is decided as soon
//! as step 4 returns; after-commit hooks can neither delay nor change it.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::PipelineConfig;
use crate::context::OperationContext;
use crate::hooks::{HookChain, HookDispatcher, HookRegistry, ShutdownReport};
use crate::mutation::Mutation;
use crate::store::Storage;
use crate::transaction::Transaction;

mod outcome;
mod retry;


pub use outcome::{ErrorKind, Failure, Outcome, PipelineError};
pub use retry::RetryPolicy;

/// Runs mutations through begin, execute, before-commit hooks, commit and
/// after-commit dispatch.
///
/// A pipeline holds no per-request state and can serve any number of
/// concurrent invocations.
#[derive(Clone)]
pub struct Pipeline {
	storage: Arc<dyn Storage>,
	hooks: HookChain,
	retry: RetryPolicy,
}

impl Pipeline {
	pub fn new(storage: Arc<dyn Storage>, registry: Arc<HookRegistry>, config: &PipelineConfig) -> Self {
		let dispatcher = HookDispatcher::new(&config.hooks);
		Self::with_dispatcher(storage, registry, dispatcher, config)
	}

	/// Build a pipeline that shares an existing dispatcher, e.g. one pool for
	/// several pipelines.
	pub fn with_dispatcher(
		storage: Arc<dyn Storage>,
		registry: Arc<HookRegistry>,
		dispatcher: HookDispatcher,
		config: &PipelineConfig,
	) -> Self {
		Self {
			storage,
			hooks: HookChain::new(registry, dispatcher, config.hooks.before_commit_timeout),
			retry: config.retry.clone(),
		}
	}

	pub fn storage(&self) -> &Arc<dyn Storage> {
		&self.storage
	}

	pub fn registry(&self) -> &HookRegistry {
		self.hooks.registry()
	}

	pub fn dispatcher(&self) -> &HookDispatcher {
		self.hooks.dispatcher()
	}

	pub fn retry_policy(&self) -> &RetryPolicy {
		&self.retry
	}

	/// Stop dispatching after-commit hooks and wait for in-flight ones.
	pub async fn shutdown(&self) -> ShutdownReport {
		self.hooks.dispatcher().shutdown().await
	}

	/// Run `mutation` against `ctx` once.
	///
	/// Returns `Success` only if the transaction committed. The context is
	/// consumed; it is handed to the after-commit hooks as a
	/// [`CommittedEvent`](crate::context::CommittedEvent).
	pub async fn run(&self, ctx: OperationContext, mutation: &dyn Mutation) -> Outcome {
		let span = info_span!(
			"pipeline",
			request_id = %ctx.request_id(),
			kind = %ctx.kind(),
			mutation = mutation.name(),
		);
		self.invoke(ctx, mutation).instrument(span).await.into()
	}

	/// Run `mutation`, starting a fresh invocation whenever the previous one
	/// failed with a retryable error and the retry policy allows another
	/// attempt.
	///
	/// `make_ctx` is called with the 1-based attempt number and must build a
	/// new context each time, typically re-reading the target entity so that
	/// a retry after a commit conflict sees the current version.
	pub async fn run_with_retry<F, Fut>(&self, mut make_ctx: F, mutation: &dyn Mutation) -> Outcome
	where
		F: FnMut(u32) -> Fut,
		Fut: Future<Output = Result<OperationContext, PipelineError>>,
	{
		let mut attempt = 1;
		loop {
			let outcome = match make_ctx(attempt).await {
				Ok(ctx) => self.run(ctx, mutation).await,
				Err(e) => Outcome::Failure(e.into_failure()),
			};
			match outcome.failure() {
				Some(failure) if failure.is_retryable() && self.retry.allows_another(attempt) => {
					warn!(
						attempt,
						max_attempts = self.retry.max_attempts,
						error = %failure,
						"retryable failure, starting a new invocation"
					);
					if let Some(backoff) = self.retry.backoff {
						tokio::time::sleep(backoff).await;
					}
					attempt += 1;
				},
				_ => return outcome,
			}
		}
	}

	async fn invoke(
		&self,
		mut ctx: OperationContext,
		mutation: &dyn Mutation,
	) -> Result<Value, PipelineError> {
		let mut tx = Transaction::new();
		if let Err(e) = tx.begin(self.storage.as_ref()).await {
			warn!(error = %e, "failed to begin transaction");
			return Err(e.into());
		}

		if let Err(e) = self.execute(&mut ctx, &mut tx, mutation).await {
			abort(&mut tx, &e).await;
			return Err(e);
		}

		if let Err(e) = tx.commit().await {
			let e = PipelineError::from_commit(e);
			abort(&mut tx, &e).await;
			return Err(e);
		}
		info!(tx_id = %tx.id(), "operation committed");

		let result = ctx.result().clone();
		self.hooks.run_after(ctx.into_committed_event());
		Ok(result)
	}

	/// Apply the mutation and run the before-commit hooks inside `tx`.
	async fn execute(
		&self,
		ctx: &mut OperationContext,
		tx: &mut Transaction,
		mutation: &dyn Mutation,
	) -> Result<(), PipelineError> {
		if !ctx.mark_executed() {
			return Err(PipelineError::Internal(
				"operation context has already been executed".to_string(),
			));
		}

		let result = mutation.apply(ctx, tx).await?;
		ctx.set_result(result);
		debug!("mutation applied");

		let staged = ctx.entity().cloned();
		self.hooks.run_before(ctx, tx).await?;

		// Hooks may edit the target entity in place; stage what they left behind.
		if let Some(current) = ctx.entity().cloned()
			&& staged.as_ref() != Some(&current)
		{
			let restaged = tx.persist(&current).await?;
			let previous = staged.as_ref().map(serde_json::to_value).transpose().map_err(internal)?;
			if previous.as_ref() == Some(ctx.result()) {
				ctx.set_result(serde_json::to_value(&restaged).map_err(internal)?);
			}
			debug!(entity_id = %restaged.id, "re-staged entity modified by before-commit hooks");
			ctx.set_entity(restaged);
		}
		Ok(())
	}
}

impl std::fmt::Debug for Pipeline {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Pipeline")
			.field("hooks", &self.hooks)
			.field("retry", &self.retry)
			.finish_non_exhaustive()
	}
}

async fn abort(tx: &mut Transaction, cause: &PipelineError) {
	warn!(tx_id = %tx.id(), kind = %cause.kind(), error = %cause, "rolling back");
	if let Err(e) = tx.rollback().await {
		error!(tx_id = %tx.id(), error = %e, "rollback failed");
	}
}

fn internal(e: serde_json::Error) -> PipelineError {
	PipelineError::Internal(format!("entity is not serializable: {e}"))
}
