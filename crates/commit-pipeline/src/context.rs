//! Data carried through a single pipeline invocation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of entity an operation targets, e.g. `user`.
///
/// Hooks are registered per entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKind(String);

impl EntityKind {
	pub fn new(kind: impl Into<String>) -> Self {
		Self(kind.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for EntityKind {
	fn from(kind: &str) -> Self {
		Self::new(kind)
	}
}

impl From<String> for EntityKind {
	fn from(kind: String) -> Self {
		Self(kind)
	}
}

/// A persisted record such as a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
	pub kind: EntityKind,
	pub id: String,
	/// Version observed when the entity was read; 0 for an entity that does not exist yet.
	#[serde(default)]
	pub version: u64,
	#[serde(default)]
	pub attributes: Value,
}

impl Entity {
	/// Create a new, not yet persisted entity.
	pub fn new(kind: impl Into<EntityKind>, id: impl Into<String>, attributes: Value) -> Self {
		Self {
			kind: kind.into(),
			id: id.into(),
			version: 0,
			attributes,
		}
	}

	/// Look up a top-level attribute.
	pub fn attr(&self, name: &str) -> Option<&Value> {
		self.attributes.get(name)
	}

	/// Set a top-level attribute, turning the attributes into an object if needed.
	pub fn set_attr(&mut self, name: impl Into<String>, value: Value) {
		if !self.attributes.is_object() {
			self.attributes = Value::Object(serde_json::Map::new());
		}
		if let Value::Object(map) = &mut self.attributes {
			map.insert(name.into(), value);
		}
	}
}

/// The authenticated principal executing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
	pub id: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub roles: Vec<String>,
}

impl Actor {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			roles: Vec::new(),
		}
	}

	pub fn with_role(mut self, role: impl Into<String>) -> Self {
		self.roles.push(role.into());
		self
	}

	pub fn has_role(&self, role: &str) -> bool {
		self.roles.iter().any(|r| r == role)
	}
}

/// Per-request state owned by the pipeline for the duration of one invocation.
///
/// Holds the already-authenticated payload, the entity being changed and the
/// result accumulated by the mutation. The pre-fetched entity is also kept
/// untouched as `original` so hooks can compare before and after.
#[derive(Debug)]
pub struct OperationContext {
	request_id: Uuid,
	kind: EntityKind,
	payload: Value,
	actor: Option<Actor>,
	original: Option<Entity>,
	entity: Option<Entity>,
	result: Value,
	executed: bool,
}

impl OperationContext {
	pub fn new(kind: impl Into<EntityKind>, payload: Value) -> Self {
		Self {
			request_id: Uuid::new_v4(),
			kind: kind.into(),
			payload,
			actor: None,
			original: None,
			entity: None,
			result: Value::Null,
			executed: false,
		}
	}

	/// Attach the pre-fetched target entity. Also records it as the original.
	pub fn with_entity(mut self, entity: Entity) -> Self {
		self.original = Some(entity.clone());
		self.entity = Some(entity);
		self
	}

	pub fn with_actor(mut self, actor: Actor) -> Self {
		self.actor = Some(actor);
		self
	}

	pub fn with_request_id(mut self, request_id: Uuid) -> Self {
		self.request_id = request_id;
		self
	}

	pub fn request_id(&self) -> Uuid {
		self.request_id
	}

	pub fn kind(&self) -> &EntityKind {
		&self.kind
	}

	pub fn payload(&self) -> &Value {
		&self.payload
	}

	pub fn actor(&self) -> Option<&Actor> {
		self.actor.as_ref()
	}

	pub fn original(&self) -> Option<&Entity> {
		self.original.as_ref()
	}

	pub fn entity(&self) -> Option<&Entity> {
		self.entity.as_ref()
	}

	pub fn entity_mut(&mut self) -> Option<&mut Entity> {
		self.entity.as_mut()
	}

	/// Replace the target entity, leaving the original untouched.
	pub fn set_entity(&mut self, entity: Entity) {
		self.entity = Some(entity);
	}

	pub fn result(&self) -> &Value {
		&self.result
	}

	pub fn set_result(&mut self, result: Value) {
		self.result = result;
	}

	/// Returns false if the mutation already ran against this context.
	pub(crate) fn mark_executed(&mut self) -> bool {
		!std::mem::replace(&mut self.executed, true)
	}

	/// Release the context into the snapshot handed to after-commit hooks.
	pub(crate) fn into_committed_event(self) -> CommittedEvent {
		CommittedEvent {
			request_id: self.request_id,
			kind: self.kind,
			entity: self.entity,
			original: self.original,
			payload: self.payload,
			actor: self.actor,
			result: self.result,
		}
	}
}

/// Immutable snapshot of a committed operation, observed by after-commit hooks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedEvent {
	pub request_id: Uuid,
	pub kind: EntityKind,
	/// The entity as committed.
	pub entity: Option<Entity>,
	/// The entity as it was before the operation.
	pub original: Option<Entity>,
	pub payload: Value,
	pub actor: Option<Actor>,
	pub result: Value,
}
