//! Crate-level error types for dispatch, execution, and registration.

/// Error produced by the codec layer when packing or unpacking an
/// [`Envelope`](crate::Envelope).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The envelope carries a different message type.
    #[error("expected message type '{expected}', found '{found}'")]
    TypeMismatch {
        /// The tag the caller asked for.
        expected: &'static str,
        /// The tag the envelope carries.
        found: String,
    },

    /// A typed message could not be serialized.
    #[error("failed to encode '{type_tag}': {source}")]
    Encode {
        /// Tag of the message being encoded.
        type_tag: &'static str,
        /// The underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// The payload bytes do not decode into the expected message.
    #[error("failed to decode '{type_tag}': {source}")]
    Decode {
        /// Tag of the envelope being decoded.
        type_tag: String,
        /// The underlying deserializer error.
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of a single command dispatch.
///
/// `Validation` is the only expected, caller-recoverable outcome: the
/// handler rejected the command and the state is unchanged. The other
/// variants are faults (see [`is_fault`](DispatchError::is_fault)). None of
/// them leaves a partial state update behind.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Business-rule rejection returned by the handler through an error
    /// effect. The message is forwarded unchanged.
    #[error("{message}")]
    Validation {
        /// Human-readable reason supplied by the handler.
        message: String,
    },

    /// The envelope's type tag has no registered handler.
    #[error("unknown command '{type_tag}' for entity type '{entity_type}'")]
    UnknownCommand {
        /// Entity type that received the command.
        entity_type: &'static str,
        /// The unresolved type tag.
        type_tag: String,
    },

    /// The payload bytes do not decode into the registered command type.
    #[error("malformed payload for command '{command_name}': {source}")]
    MalformedPayload {
        /// Registered name of the command.
        command_name: &'static str,
        /// The decode failure.
        #[source]
        source: EnvelopeError,
    },

    /// The handler broke its contract: it panicked, or its reply could not
    /// be encoded.
    #[error("contract violation in command '{command_name}': {reason}")]
    ContractViolation {
        /// Registered name of the command.
        command_name: &'static str,
        /// What went wrong.
        reason: String,
    },
}

impl DispatchError {
    /// Returns `true` for failures that indicate a defect rather than a
    /// business rejection.
    pub fn is_fault(&self) -> bool {
        !matches!(self, DispatchError::Validation { .. })
    }

    /// The rejection message, if this is a business-level failure.
    pub fn validation_message(&self) -> Option<&str> {
        match self {
            DispatchError::Validation { message } => Some(message.as_str()),
            _ => None,
        }
    }
}

/// Error returned when executing a command against an entity fails.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The dispatcher rejected or failed the command.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// No entity type with this name is registered with the store.
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    /// The reply envelope does not hold the message type the caller expected.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(#[source] EnvelopeError),

    /// The command could not be packed into an envelope.
    #[error("failed to pack command: {0}")]
    Pack(#[source] EnvelopeError),

    /// The actor task owning the entity exited before accepting the command.
    #[error("entity actor is no longer running")]
    ActorGone,
}

impl ExecuteError {
    /// The rejection message, if the handler rejected the command.
    pub fn validation_message(&self) -> Option<&str> {
        match self {
            ExecuteError::Dispatch(e) => e.validation_message(),
            _ => None,
        }
    }
}

/// Error returned when reading the current state of an entity fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The actor task owning the entity has exited.
    #[error("entity actor is no longer running")]
    ActorGone,
}

/// Error returned when an entity type cannot be registered.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// Two handlers were registered for the same command type tag.
    #[error("entity type '{entity_type}' registers type tag '{type_tag}' twice")]
    DuplicateTypeTag {
        /// The entity type being registered.
        entity_type: &'static str,
        /// The repeated tag.
        type_tag: &'static str,
    },

    /// Two handlers were registered under the same command name.
    #[error("entity type '{entity_type}' registers command '{command_name}' twice")]
    DuplicateCommandName {
        /// The entity type being registered.
        entity_type: &'static str,
        /// The repeated name.
        command_name: &'static str,
    },

    /// The entity type registers no commands.
    #[error("entity type '{entity_type}' has no command handlers")]
    EmptyRegistry {
        /// The entity type being registered.
        entity_type: &'static str,
    },

    /// Two entity types share the same `ENTITY_TYPE` name.
    #[error("entity type '{0}' is registered twice")]
    DuplicateEntityType(&'static str),
}
