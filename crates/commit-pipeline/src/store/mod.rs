//! Storage collaborators for the pipeline.
//!
//! The pipeline never talks to a concrete database. It opens units of work
//! through [`Storage::begin`] and performs all reads and writes through the
//! returned [`StorageTx`]. Implementations are expected to provide at least
//! read-committed isolation: nothing written through a `StorageTx` may be
//! visible to other readers until [`StorageTx::commit`] returns `Ok`.

use async_trait::async_trait;

use crate::context::{Entity, EntityKind};

#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// Error type for storage operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
	#[error("storage unavailable: {0}")]
	Unavailable(String),
	#[error("write conflict on {kind} '{id}': expected version {expected}, found {found}")]
	Conflict {
		kind: EntityKind,
		id: String,
		expected: u64,
		found: u64,
	},
	#[error("{kind} '{id}' not found")]
	NotFound { kind: EntityKind, id: String },
	#[error("serialization error: {0}")]
	Serialization(String),
}

impl StoreError {
	pub fn unavailable(message: impl Into<String>) -> Self {
		Self::Unavailable(message.into())
	}

	pub fn not_found(kind: &EntityKind, id: impl Into<String>) -> Self {
		Self::NotFound {
			kind: kind.clone(),
			id: id.into(),
		}
	}
}

/// Backing store able to hand out transactions.
#[async_trait]
pub trait Storage: Send + Sync {
	/// Open a new unit of work.
	///
	/// Fails with [`StoreError::Unavailable`] if the store cannot allocate one.
	async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError>;

	/// Read the last committed state of an entity, outside of any transaction.
	async fn get(&self, kind: &EntityKind, id: &str) -> Result<Option<Entity>, StoreError>;
}

/// An open unit of work against a [`Storage`].
///
/// Writes are versioned optimistically: [`Entity::version`] is the version the
/// caller observed, and `commit` fails with [`StoreError::Conflict`] if the
/// stored entity moved on in the meantime.
#[async_trait]
pub trait StorageTx: Send + Sync {
	/// Read an entity, seeing this transaction's own staged writes.
	async fn get(&self, kind: &EntityKind, id: &str) -> Result<Option<Entity>, StoreError>;

	/// Stage a write of `entity`.
	///
	/// Returns the entity as it will look once committed (its version bumped).
	async fn persist(&mut self, entity: &Entity) -> Result<Entity, StoreError>;

	/// Durably apply every staged write, all or nothing.
	///
	/// On error nothing has been applied and the staged writes are retained
	/// until `rollback` or `discard` is called.
	async fn commit(&mut self) -> Result<(), StoreError>;

	/// Throw away every staged write. Safe to call repeatedly.
	async fn rollback(&mut self) -> Result<(), StoreError>;

	/// Synchronous, infallible variant of `rollback` for use from `Drop`.
	fn discard(&mut self);
}
