//! Outcomes and errors of a pipeline invocation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hooks::{HookError, HookFailure};
use crate::mutation::MutationError;
use crate::store::StoreError;
use crate::transaction::TransactionError;

/// Classification of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// The backing store could not open or commit a transaction.
	StorageUnavailable,
	/// The commit lost a race with a concurrent writer.
	CommitConflict,
	ValidationFailed,
	NotFound,
	/// The mutation found the requested change inconsistent with current state.
	ConflictDetected,
	/// A before-commit hook vetoed the operation.
	HookRejected,
	/// A before-commit hook errored, timed out or panicked.
	HookFailed,
	Internal,
}

impl ErrorKind {
	/// Whether running a fresh invocation may succeed.
	pub fn is_retryable(self) -> bool {
		matches!(self, ErrorKind::StorageUnavailable | ErrorKind::CommitConflict)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ErrorKind::StorageUnavailable => "storage_unavailable",
			ErrorKind::CommitConflict => "commit_conflict",
			ErrorKind::ValidationFailed => "validation_failed",
			ErrorKind::NotFound => "not_found",
			ErrorKind::ConflictDetected => "conflict_detected",
			ErrorKind::HookRejected => "hook_rejected",
			ErrorKind::HookFailed => "hook_failed",
			ErrorKind::Internal => "internal",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors raised while running the synchronous stages of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
	#[error("storage unavailable: {0}")]
	StorageUnavailable(String),

	#[error("commit conflict: {0}")]
	CommitConflict(String),

	#[error(transparent)]
	Mutation(MutationError),

	#[error("hook '{hook}' rejected the operation: {reason}")]
	HookRejected { hook: String, reason: String },

	#[error("hook '{hook}' failed: {message}")]
	HookFailed { hook: String, message: String },

	#[error("internal error: {0}")]
	Internal(String),
}

impl PipelineError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			PipelineError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
			PipelineError::CommitConflict(_) => ErrorKind::CommitConflict,
			PipelineError::Mutation(MutationError::ValidationFailed(_)) => ErrorKind::ValidationFailed,
			PipelineError::Mutation(MutationError::NotFound { .. }) => ErrorKind::NotFound,
			PipelineError::Mutation(MutationError::ConflictDetected(_)) => ErrorKind::ConflictDetected,
			// Flattened by the From impl, kept for exhaustiveness
			PipelineError::Mutation(MutationError::Transaction(_)) => ErrorKind::Internal,
			PipelineError::HookRejected { .. } => ErrorKind::HookRejected,
			PipelineError::HookFailed { .. } => ErrorKind::HookFailed,
			PipelineError::Internal(_) => ErrorKind::Internal,
		}
	}

	pub fn is_retryable(&self) -> bool {
		self.kind().is_retryable()
	}

	/// Map a failed commit. A commit either conflicts or did not reach
	/// durable storage; any other storage error is reported as the latter with
	/// its cause in the message.
	pub fn from_commit(e: TransactionError) -> Self {
		match e {
			TransactionError::Storage(e @ StoreError::Conflict { .. }) => {
				PipelineError::CommitConflict(e.to_string())
			},
			TransactionError::Storage(StoreError::Unavailable(m)) => PipelineError::StorageUnavailable(m),
			TransactionError::Storage(e) => PipelineError::StorageUnavailable(e.to_string()),
			e @ TransactionError::InvalidState { .. } => PipelineError::Internal(e.to_string()),
		}
	}

	/// Convert into the caller-facing failure, keeping the cause verbatim.
	pub fn into_failure(self) -> Failure {
		let kind = self.kind();
		let (message, hook) = match self {
			PipelineError::StorageUnavailable(m) | PipelineError::CommitConflict(m) => (m, None),
			PipelineError::Mutation(MutationError::ValidationFailed(m))
			| PipelineError::Mutation(MutationError::ConflictDetected(m)) => (m, None),
			PipelineError::Mutation(e) => (e.to_string(), None),
			PipelineError::HookRejected { hook, reason } => (reason, Some(hook)),
			PipelineError::HookFailed { hook, message } => (message, Some(hook)),
			PipelineError::Internal(m) => (m, None),
		};
		Failure {
			kind,
			message,
			hook,
		}
	}
}

impl From<StoreError> for PipelineError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::Unavailable(m) => PipelineError::StorageUnavailable(m),
			e @ StoreError::Conflict { .. } => PipelineError::CommitConflict(e.to_string()),
			StoreError::NotFound { kind, id } => {
				PipelineError::Mutation(MutationError::NotFound { kind, id })
			},
			e @ StoreError::Serialization(_) => PipelineError::Internal(e.to_string()),
		}
	}
}

impl From<TransactionError> for PipelineError {
	fn from(e: TransactionError) -> Self {
		match e {
			TransactionError::Storage(e) => e.into(),
			e @ TransactionError::InvalidState { .. } => PipelineError::Internal(e.to_string()),
		}
	}
}

impl From<MutationError> for PipelineError {
	fn from(e: MutationError) -> Self {
		match e {
			MutationError::Transaction(e) => e.into(),
			e => PipelineError::Mutation(e),
		}
	}
}

impl From<HookFailure> for PipelineError {
	fn from(f: HookFailure) -> Self {
		match f.error {
			HookError::Rejected { reason } => PipelineError::HookRejected {
				hook: f.hook,
				reason,
			},
			HookError::Failed { message } => PipelineError::HookFailed {
				hook: f.hook,
				message,
			},
		}
	}
}

/// Caller-facing description of a failed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct Failure {
	pub kind: ErrorKind,
	pub message: String,
	/// The before-commit hook responsible, for hook failures.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hook: Option<String>,
}

impl Failure {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			hook: None,
		}
	}

	pub fn is_retryable(&self) -> bool {
		self.kind.is_retryable()
	}
}

impl From<PipelineError> for Failure {
	fn from(e: PipelineError) -> Self {
		e.into_failure()
	}
}

/// The terminal result of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Outcome {
	/// The change is committed; carries the operation's result.
	Success(Value),
	Failure(Failure),
}

impl Outcome {
	pub fn is_success(&self) -> bool {
		matches!(self, Outcome::Success(_))
	}

	pub fn result(&self) -> Option<&Value> {
		match self {
			Outcome::Success(v) => Some(v),
			Outcome::Failure(_) => None,
		}
	}

	pub fn failure(&self) -> Option<&Failure> {
		match self {
			Outcome::Success(_) => None,
			Outcome::Failure(f) => Some(f),
		}
	}

	pub fn into_result(self) -> Result<Value, Failure> {
		match self {
			Outcome::Success(v) => Ok(v),
			Outcome::Failure(f) => Err(f),
		}
	}
}

impl From<Result<Value, PipelineError>> for Outcome {
	fn from(result: Result<Value, PipelineError>) -> Self {
		match result {
			Ok(v) => Outcome::Success(v),
			Err(e) => Outcome::Failure(e.into_failure()),
		}
	}
}
