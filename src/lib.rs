//! Command dispatch and effect application for stateful value entities.
//!
//! An entity's handlers receive a typed command and its current state and
//! describe the outcome as an [`Effect`]; the [`Dispatcher`] applies it.
//! [`EntityStore`] runs one actor per entity id so commands for the same
//! entity never overlap.

mod actor;
pub use actor::{EntityHandle, spawn_actor};
mod command;
mod dispatcher;
pub use dispatcher::Dispatcher;
mod effect;
pub use effect::{DeleteState, Effect, EffectBuilder, UpdateState};
mod entity;
pub use entity::{HandlerRegistry, ValueEntity};
mod envelope;
mod error;
mod snapshot;
mod store;

pub use command::{CommandContext, CommandEnvelope, CommandMetadata};
pub use envelope::{Empty, Envelope, Message};
pub use error::{DispatchError, EnvelopeError, ExecuteError, RegistrationError, StateError};
pub use store::{DEFAULT_IDLE_TIMEOUT, EntityStore, EntityStoreBuilder};
