//! Mutation executors.
//!
//! A [`Mutation`] performs exactly one state-changing operation inside the
//! transaction the pipeline opened. It must never commit or roll back; the
//! pipeline owns the transaction boundary.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::{Entity, EntityKind, OperationContext};
use crate::transaction::{Transaction, TransactionError};

/// Domain errors raised by a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
	#[error("validation failed: {0}")]
	ValidationFailed(String),

	#[error("{kind} '{id}' not found")]
	NotFound { kind: EntityKind, id: String },

	#[error("conflict: {0}")]
	ConflictDetected(String),

	#[error(transparent)]
	Transaction(#[from] TransactionError),
}

impl MutationError {
	pub fn validation(message: impl Into<String>) -> Self {
		Self::ValidationFailed(message.into())
	}

	pub fn not_found(kind: &EntityKind, id: impl Into<String>) -> Self {
		Self::NotFound {
			kind: kind.clone(),
			id: id.into(),
		}
	}
}

/// A single state-changing operation run inside an open transaction.
///
/// Invoked at most once per pipeline invocation. Retrying means running a
/// whole new invocation with a new transaction. A mutation reads and stages
/// writes through `tx`; committing or rolling it back is left to the pipeline.
#[async_trait]
pub trait Mutation: Send + Sync {
	/// Name used in logs.
	fn name(&self) -> &str;

	/// Apply the change and return the operation's result.
	async fn apply(
		&self,
		ctx: &mut OperationContext,
		tx: &mut Transaction,
	) -> Result<Value, MutationError>;
}

fn require_entity(ctx: &mut OperationContext) -> Result<&mut Entity, MutationError> {
	let kind = ctx.kind().clone();
	ctx.entity_mut()
		.ok_or_else(|| MutationError::validation(format!("no target {kind} supplied")))
}

fn check_kind(ctx: &OperationContext) -> Result<(), MutationError> {
	if ctx.entity().is_some_and(|e| &e.kind != ctx.kind()) {
		return Err(MutationError::validation(format!(
			"target entity is not a {}",
			ctx.kind()
		)));
	}
	Ok(())
}

async fn stage(ctx: &mut OperationContext, tx: &mut Transaction) -> Result<Value, MutationError> {
	let entity = require_entity(ctx)?.clone();
	let staged = tx.persist(&entity).await?;
	let result = serde_json::to_value(&staged)
		.map_err(|e| MutationError::validation(format!("entity is not serializable: {e}")))?;
	ctx.set_entity(staged);
	Ok(result)
}

/// Persists the context's target entity as it currently is.
///
/// Used when the request layer already applied the change to the entity.
#[derive(Debug, Clone, Default)]
pub struct PersistEntity;

#[async_trait]
impl Mutation for PersistEntity {
	fn name(&self) -> &str {
		"persist_entity"
	}

	async fn apply(
		&self,
		ctx: &mut OperationContext,
		tx: &mut Transaction,
	) -> Result<Value, MutationError> {
		check_kind(ctx)?;
		stage(ctx, tx).await
	}
}

type Validator = Arc<dyn Fn(&Entity) -> Result<(), String> + Send + Sync>;

/// Applies the request payload to the target entity as a JSON merge patch,
/// validates the result and persists it.
///
/// Patch semantics follow RFC 7386: objects merge recursively, `null`
/// removes a key and anything else replaces the existing value.
#[derive(Clone, Default)]
pub struct MergePatch {
	required: Vec<String>,
	immutable: Vec<String>,
	validators: Vec<Validator>,
}

impl MergePatch {
	pub fn new() -> Self {
		Self::default()
	}

	/// Attributes that must be present and non-null after patching.
	pub fn require(mut self, attribute: impl Into<String>) -> Self {
		self.required.push(attribute.into());
		self
	}

	/// Attributes the payload is not allowed to touch.
	pub fn immutable(mut self, attribute: impl Into<String>) -> Self {
		self.immutable.push(attribute.into());
		self
	}

	/// An extra check run on the patched entity.
	pub fn validate_with<F>(mut self, validator: F) -> Self
	where
		F: Fn(&Entity) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validators.push(Arc::new(validator));
		self
	}

	fn check(&self, entity: &Entity) -> Result<(), MutationError> {
		for attribute in &self.required {
			if entity.attr(attribute).is_none_or(Value::is_null) {
				return Err(MutationError::validation(format!(
					"attribute '{attribute}' is required"
				)));
			}
		}
		for validator in &self.validators {
			validator(entity).map_err(MutationError::ValidationFailed)?;
		}
		Ok(())
	}
}

impl std::fmt::Debug for MergePatch {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MergePatch")
			.field("required", &self.required)
			.field("immutable", &self.immutable)
			.field("validators", &self.validators.len())
			.finish()
	}
}

#[async_trait]
impl Mutation for MergePatch {
	fn name(&self) -> &str {
		"merge_patch"
	}

	async fn apply(
		&self,
		ctx: &mut OperationContext,
		tx: &mut Transaction,
	) -> Result<Value, MutationError> {
		check_kind(ctx)?;
		let Value::Object(patch) = ctx.payload().clone() else {
			return Err(MutationError::validation("patch payload must be a JSON object"));
		};
		if let Some(attribute) = self.immutable.iter().find(|a| patch.contains_key(a.as_str())) {
			return Err(MutationError::validation(format!(
				"attribute '{attribute}' cannot be changed"
			)));
		}

		let entity = require_entity(ctx)?;
		merge_patch(&mut entity.attributes, &Value::Object(patch));
		self.check(entity)?;

		stage(ctx, tx).await
	}
}

/// Apply `patch` onto `target` following RFC 7386.
pub fn merge_patch(target: &mut Value, patch: &Value) {
	let Value::Object(patch) = patch else {
		*target = patch.clone();
		return;
	};
	if !target.is_object() {
		*target = Value::Object(Map::new());
	}
	if let Value::Object(target) = target {
		for (key, value) in patch {
			if value.is_null() {
				target.remove(key);
			} else {
				merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
			}
		}
	}
}

/// Adapts an async closure into a [`Mutation`], for handlers whose business
/// logic does not fit the built-in executors.
pub struct FnMutation<F> {
	name: String,
	f: F,
}

impl<F> FnMutation<F> {
	pub fn new(name: impl Into<String>, f: F) -> Self
	where
		F: for<'a> Fn(&'a mut OperationContext, &'a mut Transaction) -> BoxFuture<'a, Result<Value, MutationError>>
			+ Send
			+ Sync,
	{
		Self {
			name: name.into(),
			f,
		}
	}
}

#[async_trait]
impl<F> Mutation for FnMutation<F>
where
	F: for<'a> Fn(&'a mut OperationContext, &'a mut Transaction) -> BoxFuture<'a, Result<Value, MutationError>>
		+ Send
		+ Sync,
{
	fn name(&self) -> &str {
		&self.name
	}

	async fn apply(
		&self,
		ctx: &mut OperationContext,
		tx: &mut Transaction,
	) -> Result<Value, MutationError> {
		(self.f)(ctx, tx).await
	}
}
