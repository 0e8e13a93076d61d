//! Hooks observing or vetoing mutations around the commit point.
//!
//! Hooks are registered once at startup per entity kind and phase:
//!
//! - **before commit** hooks run sequentially inside the open transaction,
//!   may adjust the entity about to be saved, and can veto the operation.
//!   The first failure stops the chain and rolls the transaction back.
//! - **after commit** hooks observe an already durable change. They run in
//!   the background after the caller has its response; their failures are
//!   logged and counted but never reach the caller.

mod chain;
mod dispatcher;
mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use chain::{HookChain, HookFailure};
pub use dispatcher::{DispatchStats, HookDispatcher, ShutdownReport};
pub use registry::{HookRegistry, HookRegistryBuilder, RegistryError};

use crate::context::{Actor, CommittedEvent, Entity, EntityKind, OperationContext};
use crate::transaction::{Transaction, TransactionError};

/// The point in the pipeline at which a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
	BeforeCommit,
	AfterCommit,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Phase::BeforeCommit => f.write_str("before-commit"),
			Phase::AfterCommit => f.write_str("after-commit"),
		}
	}
}

/// Errors returned by hooks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
	/// The hook vetoed the operation. The reason is reported to the caller verbatim.
	#[error("rejected: {reason}")]
	Rejected { reason: String },

	/// The hook itself broke.
	#[error("failed: {message}")]
	Failed { message: String },
}

impl HookError {
	pub fn rejected(reason: impl Into<String>) -> Self {
		Self::Rejected {
			reason: reason.into(),
		}
	}

	pub fn failed(message: impl Into<String>) -> Self {
		Self::Failed {
			message: message.into(),
		}
	}
}

impl From<TransactionError> for HookError {
	fn from(e: TransactionError) -> Self {
		Self::failed(e.to_string())
	}
}

/// A hook run inside the transaction, before it commits.
#[async_trait]
pub trait BeforeCommitHook: Send + Sync {
	async fn before_commit(&self, ctx: &mut BeforeCommitContext<'_>) -> Result<(), HookError>;
}

/// A hook run in the background once the transaction has committed.
#[async_trait]
pub trait AfterCommitHook: Send + Sync {
	async fn after_commit(&self, event: &CommittedEvent) -> Result<(), HookError>;
}

/// A hook together with the name it was registered under.
pub struct NamedHook<H: ?Sized> {
	pub name: Arc<str>,
	pub hook: Arc<H>,
}

impl<H: ?Sized> Clone for NamedHook<H> {
	fn clone(&self) -> Self {
		Self {
			name: self.name.clone(),
			hook: self.hook.clone(),
		}
	}
}

impl<H: ?Sized> fmt::Debug for NamedHook<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("NamedHook").field("name", &self.name).finish()
	}
}

/// What a before-commit hook sees.
///
/// Gives mutable access to the entity about to be saved, read access to the
/// original entity, the acting user and the payload, and reads and writes
/// through the pipeline's transaction. Anything written here becomes durable
/// only if the whole invocation commits.
pub struct BeforeCommitContext<'a> {
	ctx: &'a mut OperationContext,
	tx: &'a mut Transaction,
}

impl<'a> BeforeCommitContext<'a> {
	pub(crate) fn new(ctx: &'a mut OperationContext, tx: &'a mut Transaction) -> Self {
		Self { ctx, tx }
	}

	pub fn request_id(&self) -> Uuid {
		self.ctx.request_id()
	}

	pub fn kind(&self) -> &EntityKind {
		self.ctx.kind()
	}

	pub fn payload(&self) -> &Value {
		self.ctx.payload()
	}

	pub fn actor(&self) -> Option<&Actor> {
		self.ctx.actor()
	}

	/// The entity about to be saved.
	pub fn entity(&self) -> Option<&Entity> {
		self.ctx.entity()
	}

	/// Adjust the entity about to be saved.
	pub fn entity_mut(&mut self) -> Option<&mut Entity> {
		self.ctx.entity_mut()
	}

	/// The entity as it was before this operation.
	pub fn original(&self) -> Option<&Entity> {
		self.ctx.original()
	}

	/// The mutation's result so far.
	pub fn result(&self) -> &Value {
		self.ctx.result()
	}

	/// Read through the open transaction.
	pub async fn get(&self, kind: &EntityKind, id: &str) -> Result<Option<Entity>, HookError> {
		Ok(self.tx.get(kind, id).await?)
	}

	/// Stage an additional write in the open transaction.
	pub async fn persist(&mut self, entity: &Entity) -> Result<Entity, HookError> {
		Ok(self.tx.persist(entity).await?)
	}
}
