//! Supervised background execution of after-commit hooks.
//!
//! Each committed invocation hands its after-commit hooks to the dispatcher
//! as one batch. A batch runs on its own task, tracked so that shutdown can
//! drain it. Within a batch every hook is started in registration order on a
//! task of its own and the batch then waits for all of them, so a hook that
//! errors, panics or never returns does not hold back the hooks after it.
//! Nothing is retried and nothing is reported back to the request that
//! triggered the batch: failures are logged and counted here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{AfterCommitHook, HookError, NamedHook};
use crate::config::HookConfig;
use crate::context::CommittedEvent;

/// Counters describing what the dispatcher has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
	pub batches_dispatched: u64,
	pub batches_dropped: u64,
	pub hooks_succeeded: u64,
	pub hooks_failed: u64,
	pub hooks_panicked: u64,
}

#[derive(Default)]
struct Counters {
	batches_dispatched: AtomicU64,
	batches_dropped: AtomicU64,
	hooks_succeeded: AtomicU64,
	hooks_failed: AtomicU64,
	hooks_panicked: AtomicU64,
}

impl Counters {
	fn snapshot(&self) -> DispatchStats {
		DispatchStats {
			batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
			batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
			hooks_succeeded: self.hooks_succeeded.load(Ordering::Relaxed),
			hooks_failed: self.hooks_failed.load(Ordering::Relaxed),
			hooks_panicked: self.hooks_panicked.load(Ordering::Relaxed),
		}
	}
}

/// Result of [`HookDispatcher::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
	/// Whether every in-flight batch finished within the grace period.
	pub drained: bool,
	/// Batches still running when the grace period ran out.
	pub abandoned: usize,
}

struct Inner {
	tracker: TaskTracker,
	permits: Arc<Semaphore>,
	// Batches dispatched but not yet finished; `idle` fires when it drops to zero.
	pending: AtomicUsize,
	idle: Notify,
	shutting_down: AtomicBool,
	warn_after: Option<Duration>,
	grace_period: Duration,
	counters: Counters,
}

/// Background pool running after-commit hook batches.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct HookDispatcher {
	inner: Arc<Inner>,
}

impl HookDispatcher {
	pub fn new(config: &HookConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				tracker: TaskTracker::new(),
				permits: Arc::new(Semaphore::new(config.max_concurrent_batches.max(1))),
				pending: AtomicUsize::new(0),
				idle: Notify::new(),
				shutting_down: AtomicBool::new(false),
				warn_after: config.after_commit_warn_after,
				grace_period: config.shutdown_grace_period,
				counters: Counters::default(),
			}),
		}
	}

	/// Schedule `hooks` to observe `event`. Returns without waiting for them.
	///
	/// Must be called from within a tokio runtime. Returns false if the batch
	/// was dropped because the dispatcher is shutting down.
	pub fn dispatch(&self, hooks: Vec<NamedHook<dyn AfterCommitHook>>, event: CommittedEvent) -> bool {
		if hooks.is_empty() {
			return true;
		}
		let inner = &self.inner;
		if inner.shutting_down.load(Ordering::Acquire) {
			inner.counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
			warn!(
				request_id = %event.request_id,
				hook_count = hooks.len(),
				"dispatcher is shutting down, dropping after-commit hooks"
			);
			return false;
		}
		inner.counters.batches_dispatched.fetch_add(1, Ordering::Relaxed);
		inner.pending.fetch_add(1, Ordering::AcqRel);

		let guard = PendingBatch(self.inner.clone());
		let event = Arc::new(event);
		inner.tracker.spawn(async move {
			let batch = &guard.0;
			// The semaphore is never closed, so acquiring only waits.
			let Ok(_permit) = batch.permits.clone().acquire_owned().await else {
				return;
			};
			let request_id = event.request_id;
			debug!(request_id = %request_id, hook_count = hooks.len(), "running after-commit hooks");
			let running: Vec<_> = hooks
				.into_iter()
				.map(|hook| {
					let name = hook.name.clone();
					let event = event.clone();
					let started = Instant::now();
					let task = tokio::spawn(async move { hook.hook.after_commit(&event).await });
					batch.settle(name, request_id, started, task)
				})
				.collect();
			join_all(running).await;
		});
		true
	}

	/// Snapshot of the dispatcher's counters.
	pub fn stats(&self) -> DispatchStats {
		self.inner.counters.snapshot()
	}

	/// Number of batches currently queued or running.
	pub fn in_flight(&self) -> usize {
		self.inner.pending.load(Ordering::Acquire)
	}

	/// Wait until no batch is queued or running.
	///
	/// Intended for tests and drain points. Does not stop the dispatcher:
	/// batches dispatched while waiting are waited for too.
	pub async fn wait_idle(&self) {
		loop {
			let mut notified = std::pin::pin!(self.inner.idle.notified());
			notified.as_mut().enable();
			if self.inner.pending.load(Ordering::Acquire) == 0 {
				return;
			}
			notified.await;
		}
	}

	/// Stop accepting batches and wait up to the configured grace period for
	/// in-flight batches to finish.
	pub async fn shutdown(&self) -> ShutdownReport {
		self.shutdown_within(self.inner.grace_period).await
	}

	pub async fn shutdown_within(&self, grace_period: Duration) -> ShutdownReport {
		let inner = &self.inner;
		inner.shutting_down.store(true, Ordering::Release);
		inner.tracker.close();

		let pending = inner.tracker.len();
		info!(pending, grace_period = ?grace_period, "shutting down hook dispatcher");

		match tokio::time::timeout(grace_period, inner.tracker.wait()).await {
			Ok(()) => ShutdownReport {
				drained: true,
				abandoned: 0,
			},
			Err(_) => {
				let abandoned = inner.tracker.len();
				warn!(abandoned, "grace period elapsed with after-commit hooks still running");
				ShutdownReport {
					drained: false,
					abandoned,
				}
			},
		}
	}
}

/// Decrements the pending count when a batch task ends, however it ends.
struct PendingBatch(Arc<Inner>);

impl Drop for PendingBatch {
	fn drop(&mut self) {
		if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.0.idle.notify_waiters();
		}
	}
}

impl Inner {
	async fn settle(
		&self,
		name: Arc<str>,
		request_id: Uuid,
		started: Instant,
		task: JoinHandle<Result<(), HookError>>,
	) {
		let joined = task.await;
		let elapsed = started.elapsed();

		if let Some(threshold) = self.warn_after
			&& elapsed > threshold
		{
			warn!(hook = %name, request_id = %request_id, elapsed = ?elapsed, "slow after-commit hook");
		}

		match joined {
			Ok(Ok(())) => {
				self.counters.hooks_succeeded.fetch_add(1, Ordering::Relaxed);
				debug!(hook = %name, request_id = %request_id, elapsed = ?elapsed, "after-commit hook completed");
			},
			Ok(Err(e)) => {
				self.counters.hooks_failed.fetch_add(1, Ordering::Relaxed);
				let level_error = matches!(e, HookError::Failed { .. });
				if level_error {
					error!(hook = %name, request_id = %request_id, error = %e, "after-commit hook failed");
				} else {
					warn!(hook = %name, request_id = %request_id, error = %e, "after-commit hook returned a rejection, ignored");
				}
			},
			Err(e) if e.is_panic() => {
				self.counters.hooks_panicked.fetch_add(1, Ordering::Relaxed);
				error!(hook = %name, request_id = %request_id, "after-commit hook panicked");
			},
			Err(e) => {
				self.counters.hooks_failed.fetch_add(1, Ordering::Relaxed);
				error!(hook = %name, request_id = %request_id, error = %e, "after-commit hook was cancelled");
			},
		}
	}
}

impl std::fmt::Debug for HookDispatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HookDispatcher")
			.field("in_flight", &self.in_flight())
			.field("stats", &self.stats())
			.finish()
	}
}
