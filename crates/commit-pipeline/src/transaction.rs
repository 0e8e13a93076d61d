//! Transaction context for a single pipeline invocation.
//!
//! A [`Transaction`] wraps one [`StorageTx`] and walks the
//! `Idle -> Open -> {Committed, RolledBack}` lifecycle. It is a guard: if it
//! is dropped while still open (a panic, a cancelled future, an early return
//! that forgot to settle it) its staged writes are discarded, so nothing a
//! failed invocation wrote can ever become visible.

use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{Entity, EntityKind};
use crate::store::{Storage, StorageTx, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
	Idle,
	Open,
	Committed,
	RolledBack,
}

impl TxState {
	pub fn is_terminal(self) -> bool {
		matches!(self, TxState::Committed | TxState::RolledBack)
	}
}

impl fmt::Display for TxState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			TxState::Idle => "idle",
			TxState::Open => "open",
			TxState::Committed => "committed",
			TxState::RolledBack => "rolled back",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
	#[error(transparent)]
	Storage(#[from] StoreError),

	#[error("cannot {op} a transaction that is {state}")]
	InvalidState { op: &'static str, state: TxState },
}

/// A unit of work owned by exactly one pipeline invocation.
///
/// Mutations and hooks can read and stage writes, but only the pipeline
/// opens, commits or rolls back a transaction:
///
/// ```compile_fail
/// async fn sneak_commit(tx: &mut commit_pipeline::Transaction) {
/// 	tx.commit().await.ok();
/// }
/// ```
///
/// ```compile_fail
/// async fn sneak_rollback(tx: &mut commit_pipeline::Transaction) {
/// 	tx.rollback().await.ok();
/// }
/// ```
pub struct Transaction {
	id: Uuid,
	state: TxState,
	inner: Option<Box<dyn StorageTx>>,
}

impl Transaction {
	/// Create an idle transaction. Nothing is allocated until [`Transaction::begin`].
	pub(crate) fn new() -> Self {
		Self {
			id: Uuid::new_v4(),
			state: TxState::Idle,
			inner: None,
		}
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn state(&self) -> TxState {
		self.state
	}

	/// Open the transaction against `storage`.
	pub(crate) async fn begin(&mut self, storage: &dyn Storage) -> Result<(), TransactionError> {
		if self.state != TxState::Idle {
			return Err(self.invalid("begin"));
		}
		let inner = storage.begin().await?;
		self.inner = Some(inner);
		self.state = TxState::Open;
		debug!(tx_id = %self.id, "transaction opened");
		Ok(())
	}

	/// Read an entity through the transaction, seeing its own staged writes.
	pub async fn get(&self, kind: &EntityKind, id: &str) -> Result<Option<Entity>, TransactionError> {
		let inner = self.open_ref("read from")?;
		Ok(inner.get(kind, id).await?)
	}

	/// Stage a write. Returns the entity as it will be once committed.
	pub async fn persist(&mut self, entity: &Entity) -> Result<Entity, TransactionError> {
		let inner = self.open_mut("write to")?;
		Ok(inner.persist(entity).await?)
	}

	/// Durably apply all staged writes.
	///
	/// On failure the transaction stays open; the caller must roll it back.
	pub(crate) async fn commit(&mut self) -> Result<(), TransactionError> {
		let id = self.id;
		let inner = self.open_mut("commit")?;
		inner.commit().await?;
		self.state = TxState::Committed;
		self.inner = None;
		debug!(tx_id = %id, "transaction committed");
		Ok(())
	}

	/// Discard all staged writes.
	///
	/// Idempotent: rolling back an idle or already rolled back transaction is
	/// a no-op. Rolling back a committed transaction is refused.
	pub(crate) async fn rollback(&mut self) -> Result<(), TransactionError> {
		match self.state {
			TxState::Idle | TxState::RolledBack => Ok(()),
			TxState::Committed => {
				warn!(tx_id = %self.id, "refusing to roll back a committed transaction");
				Err(self.invalid("roll back"))
			},
			TxState::Open => {
				let result = match self.inner.as_mut() {
					Some(inner) => inner.rollback().await,
					None => Ok(()),
				};
				if let Err(e) = &result
					&& let Some(inner) = self.inner.as_mut()
				{
					warn!(tx_id = %self.id, error = %e, "rollback failed, discarding staged writes");
					inner.discard();
				}
				self.state = TxState::RolledBack;
				self.inner = None;
				debug!(tx_id = %self.id, "transaction rolled back");
				Ok(())
			},
		}
	}

	fn open_ref(&self, op: &'static str) -> Result<&dyn StorageTx, TransactionError> {
		match (&self.state, &self.inner) {
			(TxState::Open, Some(inner)) => Ok(inner.as_ref()),
			_ => Err(self.invalid(op)),
		}
	}

	fn open_mut(&mut self, op: &'static str) -> Result<&mut Box<dyn StorageTx>, TransactionError> {
		let state = self.state;
		match (state, self.inner.as_mut()) {
			(TxState::Open, Some(inner)) => Ok(inner),
			_ => Err(TransactionError::InvalidState { op, state }),
		}
	}

	fn invalid(&self, op: &'static str) -> TransactionError {
		TransactionError::InvalidState {
			op,
			state: self.state,
		}
	}
}

impl Drop for Transaction {
	fn drop(&mut self) {
		if self.state == TxState::Open
			&& let Some(inner) = self.inner.as_mut()
		{
			warn!(tx_id = %self.id, "transaction dropped while open, discarding staged writes");
			inner.discard();
			self.state = TxState::RolledBack;
		}
	}
}

impl fmt::Debug for Transaction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Transaction")
			.field("id", &self.id)
			.field("state", &self.state)
			.finish()
	}
}
