//! Command metadata, per-invocation context, and the routing envelope.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::effect::EffectBuilder;
use crate::envelope::Envelope;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and correlation information without polluting the
/// command message types. Handlers read it through
/// [`CommandContext::metadata`].
///
/// # Examples
///
/// ```
/// use valuefold::CommandMetadata;
/// use serde_json::json;
///
/// let meta = CommandMetadata::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_extra(json!({"source": "api"}));
///
/// assert_eq!(meta.actor.as_deref(), Some("user-42"));
/// assert_eq!(meta.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(meta.extra.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Identity of the caller issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across entities.
    pub correlation_id: Option<String>,
    /// Arbitrary additional metadata.
    pub extra: Option<Value>,
}

impl CommandMetadata {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary additional metadata.
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Per-invocation view handed to a command handler.
///
/// Exposes the entity id, the resolved command name, the command id, the
/// caller's metadata, and the [`EffectBuilder`]. Nothing else: no state
/// access, no I/O, no clock. The borrow ties the context to a single
/// handler call, so it cannot be retained afterwards.
pub struct CommandContext<'a, S> {
    entity_id: &'a str,
    command_name: &'static str,
    command_id: u64,
    metadata: &'a CommandMetadata,
    _state: PhantomData<fn() -> S>,
}

impl<'a, S> CommandContext<'a, S> {
    pub(crate) fn new(
        entity_id: &'a str,
        command_name: &'static str,
        command_id: u64,
        metadata: &'a CommandMetadata,
    ) -> Self {
        Self {
            entity_id,
            command_name,
            command_id,
            metadata,
            _state: PhantomData,
        }
    }

    /// The id of the entity instance the command is addressed to.
    pub fn entity_id(&self) -> &str {
        self.entity_id
    }

    /// The registered name of the command being handled.
    pub fn command_name(&self) -> &str {
        self.command_name
    }

    /// Sequence number of this command within the entity's lifetime,
    /// starting at 1. Commands rejected before a handler runs do not
    /// consume an id.
    pub fn command_id(&self) -> u64 {
        self.command_id
    }

    /// Metadata supplied by the caller.
    pub fn metadata(&self) -> &CommandMetadata {
        self.metadata
    }

    /// Start building the [`Effect`](crate::Effect) for this command.
    pub fn effects(&self) -> EffectBuilder<S> {
        EffectBuilder::new()
    }
}

impl<S> fmt::Debug for CommandContext<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("entity_id", &self.entity_id)
            .field("command_name", &self.command_name)
            .field("command_id", &self.command_id)
            .finish_non_exhaustive()
    }
}

/// A type-erased command addressed to an entity instance.
///
/// This is the frame a host transport hands to
/// [`EntityStore::dispatch`](crate::EntityStore::dispatch): the target
/// entity type and id, the command [`Envelope`], and the caller metadata.
///
/// # Fields
///
/// * `entity_type` - Target entity type (must match `ValueEntity::ENTITY_TYPE`).
/// * `entity_id` - Target entity instance identifier.
/// * `command` - The tagged, serialized command.
/// * `metadata` - Cross-cutting metadata forwarded to the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Target entity type name.
    pub entity_type: String,
    /// Target entity instance identifier.
    pub entity_id: String,
    /// The tagged, serialized command.
    pub command: Envelope,
    /// Cross-cutting metadata forwarded to the handler.
    #[serde(default)]
    pub metadata: CommandMetadata,
}

impl CommandEnvelope {
    /// Address `command` to entity `entity_id` of type `entity_type`,
    /// with empty metadata.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        command: Envelope,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            command,
            metadata: CommandMetadata::default(),
        }
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, metadata: CommandMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
