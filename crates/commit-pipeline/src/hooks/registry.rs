// Hook registry
//
// Maps (entity kind, phase) to the hooks registered for it, in registration
// order. Built once during startup and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::{AfterCommitHook, BeforeCommitHook, NamedHook, Phase};
use crate::context::EntityKind;

/// Errors that can occur while registering hooks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("duplicate {phase} hook '{name}' for {kind}")]
	DuplicateHook {
		kind: EntityKind,
		phase: Phase,
		name: String,
	},

	#[error("hook name must not be empty")]
	EmptyName,
}

/// Collects hook registrations before freezing them into a [`HookRegistry`].
#[derive(Default)]
pub struct HookRegistryBuilder {
	before: HashMap<EntityKind, Vec<NamedHook<dyn BeforeCommitHook>>>,
	after: HashMap<EntityKind, Vec<NamedHook<dyn AfterCommitHook>>>,
}

impl HookRegistryBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a before-commit hook. Hooks run in the order they were registered.
	pub fn before_commit(
		&mut self,
		kind: impl Into<EntityKind>,
		name: impl Into<String>,
		hook: impl BeforeCommitHook + 'static,
	) -> Result<&mut Self, RegistryError> {
		self.before_commit_arc(kind, name, Arc::new(hook))
	}

	pub fn before_commit_arc(
		&mut self,
		kind: impl Into<EntityKind>,
		name: impl Into<String>,
		hook: Arc<dyn BeforeCommitHook>,
	) -> Result<&mut Self, RegistryError> {
		let kind = kind.into();
		let name = name.into();
		let hooks = self.before.entry(kind.clone()).or_default();
		push_unique(hooks, &kind, Phase::BeforeCommit, name, hook)?;
		Ok(self)
	}

	/// Register an after-commit hook. Hooks are started in the order they were registered.
	pub fn after_commit(
		&mut self,
		kind: impl Into<EntityKind>,
		name: impl Into<String>,
		hook: impl AfterCommitHook + 'static,
	) -> Result<&mut Self, RegistryError> {
		self.after_commit_arc(kind, name, Arc::new(hook))
	}

	pub fn after_commit_arc(
		&mut self,
		kind: impl Into<EntityKind>,
		name: impl Into<String>,
		hook: Arc<dyn AfterCommitHook>,
	) -> Result<&mut Self, RegistryError> {
		let kind = kind.into();
		let name = name.into();
		let hooks = self.after.entry(kind.clone()).or_default();
		push_unique(hooks, &kind, Phase::AfterCommit, name, hook)?;
		Ok(self)
	}

	/// Freeze the registrations.
	pub fn build(self) -> HookRegistry {
		HookRegistry {
			before: self.before,
			after: self.after,
		}
	}
}

fn push_unique<H: ?Sized>(
	hooks: &mut Vec<NamedHook<H>>,
	kind: &EntityKind,
	phase: Phase,
	name: String,
	hook: Arc<H>,
) -> Result<(), RegistryError> {
	if name.is_empty() {
		return Err(RegistryError::EmptyName);
	}
	if hooks.iter().any(|h| *h.name == *name) {
		return Err(RegistryError::DuplicateHook {
			kind: kind.clone(),
			phase,
			name,
		});
	}
	debug!(kind = %kind, phase = %phase, hook = %name, "registered hook");
	hooks.push(NamedHook {
		name: name.into(),
		hook,
	});
	Ok(())
}

/// Immutable mapping from (entity kind, phase) to ordered hooks.
#[derive(Default)]
pub struct HookRegistry {
	before: HashMap<EntityKind, Vec<NamedHook<dyn BeforeCommitHook>>>,
	after: HashMap<EntityKind, Vec<NamedHook<dyn AfterCommitHook>>>,
}

impl HookRegistry {
	pub fn builder() -> HookRegistryBuilder {
		HookRegistryBuilder::new()
	}

	/// A registry with no hooks at all.
	pub fn empty() -> Self {
		Self::default()
	}

	pub fn before_commit(&self, kind: &EntityKind) -> &[NamedHook<dyn BeforeCommitHook>] {
		self.before.get(kind).map(Vec::as_slice).unwrap_or_default()
	}

	pub fn after_commit(&self, kind: &EntityKind) -> &[NamedHook<dyn AfterCommitHook>] {
		self.after.get(kind).map(Vec::as_slice).unwrap_or_default()
	}

	/// Names of the hooks registered for `kind` in `phase`, in invocation order.
	pub fn hook_names(&self, kind: &EntityKind, phase: Phase) -> Vec<&str> {
		match phase {
			Phase::BeforeCommit => self.before_commit(kind).iter().map(|h| &*h.name).collect(),
			Phase::AfterCommit => self.after_commit(kind).iter().map(|h| &*h.name).collect(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.before.values().all(Vec::is_empty) && self.after.values().all(Vec::is_empty)
	}
}

impl std::fmt::Debug for HookRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HookRegistry")
			.field("before", &self.before)
			.field("after", &self.after)
			.finish()
	}
}
