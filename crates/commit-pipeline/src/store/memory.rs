//! In-memory implementation of Storage for testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;

use super::{Storage, StorageTx, StoreError};
use crate::context::{Entity, EntityKind};

type Key = (EntityKind, String);

fn key_of(entity: &Entity) -> Key {
	(entity.kind.clone(), entity.id.clone())
}

/// One-shot faults consumed by the next matching operation.
#[derive(Default)]
struct Faults {
	begin: Option<String>,
	commit: Option<String>,
	conflict: bool,
}

#[derive(Default)]
struct Inner {
	entities: HashMap<Key, Entity>,
	faults: Faults,
	commits: u64,
	rollbacks: u64,
}

/// In-memory implementation of [`Storage`].
///
/// Committed entities live in a single map guarded by a mutex; each
/// transaction buffers its writes privately and applies them atomically on
/// commit after checking versions. Faults can be injected to exercise the
/// failure paths of callers.
#[derive(Clone, Default)]
pub struct MemoryStorage {
	inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
	/// Create a new empty memory store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert an entity directly as committed state.
	///
	/// The stored version is at least 1 so that the entity reads as existing.
	pub fn seed(&self, mut entity: Entity) -> Entity {
		entity.version = entity.version.max(1);
		self.inner
			.lock()
			.entities
			.insert(key_of(&entity), entity.clone());
		entity
	}

	/// Overwrite an entity's attributes as an outside writer would, bumping its version.
	pub fn put(&self, kind: &EntityKind, id: &str, attributes: serde_json::Value) -> Option<Entity> {
		let mut inner = self.inner.lock();
		let entity = inner.entities.get_mut(&(kind.clone(), id.to_string()))?;
		entity.attributes = attributes;
		entity.version += 1;
		Some(entity.clone())
	}

	/// Read the committed state of an entity without going through a transaction.
	pub fn committed(&self, kind: &EntityKind, id: &str) -> Option<Entity> {
		self.inner
			.lock()
			.entities
			.get(&(kind.clone(), id.to_string()))
			.cloned()
	}

	/// Make the next `begin` fail with [`StoreError::Unavailable`].
	pub fn fail_next_begin(&self, message: impl Into<String>) {
		self.inner.lock().faults.begin = Some(message.into());
	}

	/// Make the next `commit` fail with [`StoreError::Unavailable`].
	pub fn fail_next_commit(&self, message: impl Into<String>) {
		self.inner.lock().faults.commit = Some(message.into());
	}

	/// Make the next `commit` fail with [`StoreError::Conflict`].
	pub fn conflict_next_commit(&self) {
		self.inner.lock().faults.conflict = true;
	}

	/// Number of successful commits so far.
	pub fn commit_count(&self) -> u64 {
		self.inner.lock().commits
	}

	/// Number of transactions rolled back or discarded with staged writes.
	pub fn rollback_count(&self) -> u64 {
		self.inner.lock().rollbacks
	}

	/// Get the number of committed entities.
	pub fn len(&self) -> usize {
		self.inner.lock().entities.len()
	}

	/// Check if the store is empty.
	pub fn is_empty(&self) -> bool {
		self.inner.lock().entities.is_empty()
	}
}

#[async_trait]
impl Storage for MemoryStorage {
	async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError> {
		if let Some(message) = self.inner.lock().faults.begin.take() {
			return Err(StoreError::Unavailable(message));
		}
		Ok(Box::new(MemoryTx {
			inner: self.inner.clone(),
			staged: IndexMap::new(),
		}))
	}

	async fn get(&self, kind: &EntityKind, id: &str) -> Result<Option<Entity>, StoreError> {
		Ok(self.committed(kind, id))
	}
}

/// A staged write and the version it was based on.
struct Staged {
	entity: Entity,
	expected: u64,
}

struct MemoryTx {
	inner: Arc<Mutex<Inner>>,
	staged: IndexMap<Key, Staged>,
}

impl MemoryTx {
	fn clear(&mut self) {
		if !self.staged.is_empty() {
			self.staged.clear();
			self.inner.lock().rollbacks += 1;
		}
	}
}

#[async_trait]
impl StorageTx for MemoryTx {
	async fn get(&self, kind: &EntityKind, id: &str) -> Result<Option<Entity>, StoreError> {
		let key = (kind.clone(), id.to_string());
		if let Some(staged) = self.staged.get(&key) {
			return Ok(Some(staged.entity.clone()));
		}
		Ok(self.inner.lock().entities.get(&key).cloned())
	}

	async fn persist(&mut self, entity: &Entity) -> Result<Entity, StoreError> {
		let key = key_of(entity);
		// Re-staging keeps the version the first write was based on.
		let expected = match self.staged.get(&key) {
			Some(previous) => previous.expected,
			None => entity.version,
		};
		let mut next = entity.clone();
		next.version = expected + 1;
		self.staged.insert(
			key,
			Staged {
				entity: next.clone(),
				expected,
			},
		);
		Ok(next)
	}

	async fn commit(&mut self) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();

		if let Some(message) = inner.faults.commit.take() {
			return Err(StoreError::Unavailable(message));
		}

		if std::mem::take(&mut inner.faults.conflict)
			&& let Some(((kind, id), staged)) = self.staged.first()
		{
			return Err(StoreError::Conflict {
				kind: kind.clone(),
				id: id.clone(),
				expected: staged.expected,
				found: staged.expected + 1,
			});
		}

		// Validate everything before applying anything.
		for ((kind, id), staged) in &self.staged {
			let found = inner
				.entities
				.get(&(kind.clone(), id.clone()))
				.map_or(0, |e| e.version);
			if found != staged.expected {
				return Err(StoreError::Conflict {
					kind: kind.clone(),
					id: id.clone(),
					expected: staged.expected,
					found,
				});
			}
		}

		for (key, staged) in self.staged.drain(..) {
			inner.entities.insert(key, staged.entity);
		}
		inner.commits += 1;
		Ok(())
	}

	async fn rollback(&mut self) -> Result<(), StoreError> {
		self.clear();
		Ok(())
	}

	fn discard(&mut self) {
		self.clear();
	}
}
