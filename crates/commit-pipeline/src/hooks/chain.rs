//! Running the registered hooks for an operation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use super::{BeforeCommitContext, HookDispatcher, HookError, HookRegistry};
use crate::context::{CommittedEvent, OperationContext};
use crate::transaction::Transaction;

/// The before-commit hook that stopped the chain, and why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("hook '{hook}' {error}")]
pub struct HookFailure {
	pub hook: String,
	pub error: HookError,
}

/// Runs the before- and after-commit hooks registered for an operation's entity kind.
#[derive(Debug, Clone)]
pub struct HookChain {
	registry: Arc<HookRegistry>,
	dispatcher: HookDispatcher,
	before_timeout: Option<Duration>,
}

impl HookChain {
	pub fn new(
		registry: Arc<HookRegistry>,
		dispatcher: HookDispatcher,
		before_timeout: Option<Duration>,
	) -> Self {
		Self {
			registry,
			dispatcher,
			before_timeout,
		}
	}

	pub fn registry(&self) -> &HookRegistry {
		&self.registry
	}

	pub fn dispatcher(&self) -> &HookDispatcher {
		&self.dispatcher
	}

	/// Invoke every before-commit hook for the context's entity kind, in
	/// registration order, stopping at the first failure.
	///
	/// Timeouts and panics count as failures of the hook that caused them.
	pub async fn run_before(
		&self,
		ctx: &mut OperationContext,
		tx: &mut Transaction,
	) -> Result<(), HookFailure> {
		let hooks = self.registry.before_commit(ctx.kind());
		if hooks.is_empty() {
			return Ok(());
		}
		let request_id = ctx.request_id();
		let mut hook_ctx = BeforeCommitContext::new(ctx, tx);

		for (idx, named) in hooks.iter().enumerate() {
			debug!(hook = %named.name, hook_index = idx, request_id = %request_id, "running before-commit hook");

			let call = AssertUnwindSafe(named.hook.before_commit(&mut hook_ctx)).catch_unwind();
			let outcome = match self.before_timeout {
				Some(limit) => match tokio::time::timeout(limit, call).await {
					Ok(outcome) => outcome,
					Err(_) => Ok(Err(HookError::failed(format!("timed out after {limit:?}")))),
				},
				None => call.await,
			};
			let result = outcome.unwrap_or_else(|_| Err(HookError::failed("panicked")));

			if let Err(error) = result {
				warn!(
					hook = %named.name,
					request_id = %request_id,
					error = %error,
					skipped = hooks.len() - idx - 1,
					"before-commit hook stopped the chain"
				);
				return Err(HookFailure {
					hook: named.name.to_string(),
					error,
				});
			}
		}
		Ok(())
	}

	/// Hand every after-commit hook for the event's entity kind to the
	/// dispatcher and return immediately.
	pub fn run_after(&self, event: CommittedEvent) {
		let hooks = self.registry.after_commit(&event.kind).to_vec();
		if hooks.is_empty() {
			return;
		}
		self.dispatcher.dispatch(hooks, event);
	}
}
