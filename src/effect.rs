//! Declarative command outcomes and the builder handlers use to make them.
//!
//! A handler never mutates state or sends replies itself. It returns an
//! [`Effect`] describing what should happen, built through the
//! [`EffectBuilder`] exposed on [`CommandContext::effects`]. Every builder
//! path ends in exactly one terminal call that consumes the builder and
//! yields an `Effect`, which has no builder methods of its own. Two terminal
//! calls on one builder therefore do not compile, and a handler that makes
//! none has no value to return.
//!
//! [`CommandContext::effects`]: crate::CommandContext::effects

use std::fmt;
use std::marker::PhantomData;

/// The outcome of handling one command.
///
/// Opaque: only the dispatcher interprets it. The inspection methods exist
/// so handlers can be unit tested.
///
/// # Type Parameters
///
/// * `S` - The entity state type.
/// * `R` - The reply message type.
#[must_use = "an Effect does nothing unless returned to the dispatcher"]
pub struct Effect<S, R> {
    kind: EffectKind<S, R>,
}

/// The variants the dispatcher interprets.
pub(crate) enum EffectKind<S, R> {
    /// Leave state unchanged and reply.
    Reply(R),
    /// Leave state unchanged and fail with a business-level message.
    Error(String),
    /// Replace the state wholesale, then reply.
    UpdateStateThenReply { state: S, reply: R },
    /// Return the state to the entity type's empty state, then reply.
    DeleteStateThenReply { reply: R },
}

impl<S, R> Effect<S, R> {
    pub(crate) fn into_kind(self) -> EffectKind<S, R> {
        self.kind
    }

    /// Returns `true` if this effect rejects the command.
    pub fn is_error(&self) -> bool {
        matches!(self.kind, EffectKind::Error(_))
    }

    /// The rejection message, if this is an error effect.
    pub fn error_message(&self) -> Option<&str> {
        match &self.kind {
            EffectKind::Error(message) => Some(message.as_str()),
            _ => None,
        }
    }

    /// The reply payload, if this effect replies.
    pub fn reply(&self) -> Option<&R> {
        match &self.kind {
            EffectKind::Reply(reply)
            | EffectKind::UpdateStateThenReply { reply, .. }
            | EffectKind::DeleteStateThenReply { reply } => Some(reply),
            EffectKind::Error(_) => None,
        }
    }

    /// The replacement state, if this effect updates state.
    pub fn updated_state(&self) -> Option<&S> {
        match &self.kind {
            EffectKind::UpdateStateThenReply { state, .. } => Some(state),
            _ => None,
        }
    }

    /// Returns `true` if applying this effect changes the entity state.
    pub fn changes_state(&self) -> bool {
        matches!(
            self.kind,
            EffectKind::UpdateStateThenReply { .. } | EffectKind::DeleteStateThenReply { .. }
        )
    }

    /// Returns `true` if this effect resets the entity to its empty state.
    pub fn deletes_state(&self) -> bool {
        matches!(self.kind, EffectKind::DeleteStateThenReply { .. })
    }
}

impl<S: fmt::Debug, R: fmt::Debug> fmt::Debug for Effect<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EffectKind::Reply(reply) => f.debug_tuple("Reply").field(reply).finish(),
            EffectKind::Error(message) => f.debug_tuple("Error").field(message).finish(),
            EffectKind::UpdateStateThenReply { state, reply } => f
                .debug_struct("UpdateStateThenReply")
                .field("state", state)
                .field("reply", reply)
                .finish(),
            EffectKind::DeleteStateThenReply { reply } => f
                .debug_struct("DeleteStateThenReply")
                .field("reply", reply)
                .finish(),
        }
    }
}

/// Entry point for building an [`Effect`].
///
/// Obtained from [`CommandContext::effects`](crate::CommandContext::effects).
/// Each method consumes the builder.
#[must_use = "call a terminal method to produce an Effect"]
pub struct EffectBuilder<S> {
    // `fn() -> S` keeps the builder `Send + Sync` whatever `S` is.
    _state: PhantomData<fn() -> S>,
}

impl<S> EffectBuilder<S> {
    pub(crate) fn new() -> Self {
        Self {
            _state: PhantomData,
        }
    }

    /// Reply with `payload`, leaving the state unchanged.
    pub fn reply<R>(self, payload: R) -> Effect<S, R> {
        Effect {
            kind: EffectKind::Reply(payload),
        }
    }

    /// Reject the command with a human-readable message.
    ///
    /// The state is guaranteed unchanged.
    pub fn error<R>(self, message: impl Into<String>) -> Effect<S, R> {
        Effect {
            kind: EffectKind::Error(message.into()),
        }
    }

    /// Replace the state with `new_state`. Must be followed by
    /// [`then_reply`](UpdateState::then_reply).
    pub fn update_state(self, new_state: S) -> UpdateState<S> {
        UpdateState { state: new_state }
    }

    /// Return the entity to its empty state. Must be followed by
    /// [`then_reply`](DeleteState::then_reply).
    pub fn delete_state(self) -> DeleteState<S> {
        DeleteState {
            _state: PhantomData,
        }
    }
}

/// A pending state replacement waiting for its reply.
#[must_use = "call then_reply to produce an Effect"]
pub struct UpdateState<S> {
    state: S,
}

impl<S> UpdateState<S> {
    /// Finish the effect: the state is replaced, then `payload` is returned.
    pub fn then_reply<R>(self, payload: R) -> Effect<S, R> {
        Effect {
            kind: EffectKind::UpdateStateThenReply {
                state: self.state,
                reply: payload,
            },
        }
    }
}

/// A pending state deletion waiting for its reply.
#[must_use = "call then_reply to produce an Effect"]
pub struct DeleteState<S> {
    _state: PhantomData<fn() -> S>,
}

impl<S> DeleteState<S> {
    /// Finish the effect: the state is reset, then `payload` is returned.
    pub fn then_reply<R>(self, payload: R) -> Effect<S, R> {
        Effect {
            kind: EffectKind::DeleteStateThenReply { reply: payload },
        }
    }
}
