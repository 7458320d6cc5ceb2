//! The command dispatch core: decode, invoke, interpret, apply.
//!
//! A [`Dispatcher`] owns the authoritative state of one entity instance.
//! [`handle_command`](Dispatcher::handle_command) takes an inbound
//! [`Envelope`] through four phases:
//!
//! 1. **Decoding** -- resolve the type tag through the entity type's
//!    [`HandlerRegistry`] and decode the payload. Unknown tags and bad bytes
//!    fail here, before any handler runs.
//! 2. **Invoking** -- call the handler with a shared borrow of the state and
//!    a fresh [`CommandContext`]. A panic is caught and becomes a contract
//!    violation.
//! 3. **Interpreting** -- turn the returned [`Effect`] into an outcome,
//!    encoding the reply. A reply that cannot be encoded is a contract
//!    violation and the candidate state is discarded.
//! 4. **Applying** -- replace the state with a single assignment, if the
//!    effect asks for it, and return the reply envelope.
//!
//! Nothing is written to the state unless every earlier phase succeeded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::command::{CommandContext, CommandMetadata};
use crate::effect::{Effect, EffectKind};
use crate::entity::{HandlerRegistry, ValueEntity};
use crate::envelope::{Envelope, Message};
use crate::error::{DispatchError, ExecuteError, RegistrationError};
use crate::snapshot::Snapshot;

/// Type-erased handler stored in a [`HandlerRegistry`].
///
/// Decodes the command envelope, invokes the typed handler, and interprets
/// the typed effect into an [`Outcome`] with an encoded reply.
pub(crate) type ErasedHandler<E> = Box<
    dyn Fn(
            &E,
            &<E as ValueEntity>::State,
            &Envelope,
            &CommandContext<'_, <E as ValueEntity>::State>,
        ) -> Result<Outcome<<E as ValueEntity>::State>, DispatchError>
        + Send
        + Sync,
>;

/// An interpreted effect, with the reply already encoded.
pub(crate) enum Outcome<S> {
    Reply(Envelope),
    Rejected(String),
    Replace { state: S, reply: Envelope },
    Reset { reply: Envelope },
}

/// Wrap a typed handler into an [`ErasedHandler`].
pub(crate) fn typed_handler<E, C, R, F>(command_name: &'static str, handler: F) -> ErasedHandler<E>
where
    E: ValueEntity,
    C: Message,
    R: Message,
    F: Fn(&E, &E::State, C, &CommandContext<'_, E::State>) -> Effect<E::State, R>
        + Send
        + Sync
        + 'static,
{
    erase(move |entity, state, command, ctx| {
        let cmd: C = command
            .decode_unchecked()
            .map_err(|source| DispatchError::MalformedPayload {
                command_name,
                source,
            })?;

        let effect = panic::catch_unwind(AssertUnwindSafe(|| handler(entity, state, cmd, ctx)))
            .map_err(|payload| DispatchError::ContractViolation {
                command_name,
                reason: format!("handler panicked: {}", panic_message(payload.as_ref())),
            })?;

        interpret(command_name, effect)
    })
}

fn erase<E, H>(handler: H) -> ErasedHandler<E>
where
    E: ValueEntity,
    H: Fn(
            &E,
            &E::State,
            &Envelope,
            &CommandContext<'_, E::State>,
        ) -> Result<Outcome<E::State>, DispatchError>
        + Send
        + Sync
        + 'static,
{
    Box::new(handler)
}

/// Turn a typed effect into an [`Outcome`], encoding the reply.
fn interpret<S, R: Message>(
    command_name: &'static str,
    effect: Effect<S, R>,
) -> Result<Outcome<S>, DispatchError> {
    let encode = |reply: &R| {
        Envelope::pack(reply).map_err(|e| DispatchError::ContractViolation {
            command_name,
            reason: format!("reply could not be encoded: {e}"),
        })
    };

    Ok(match effect.into_kind() {
        EffectKind::Error(message) => Outcome::Rejected(message),
        EffectKind::Reply(reply) => Outcome::Reply(encode(&reply)?),
        EffectKind::UpdateStateThenReply { state, reply } => Outcome::Replace {
            reply: encode(&reply)?,
            state,
        },
        EffectKind::DeleteStateThenReply { reply } => Outcome::Reset {
            reply: encode(&reply)?,
        },
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Owns the state of one entity instance and applies commands to it.
///
/// Commands are handled one at a time through `&mut self`; the state seen
/// by command *n + 1* is exactly the state left by command *n*. The async
/// runtime gives each live instance its own actor wrapping a `Dispatcher`,
/// but the type is usable on its own for synchronous hosts and tests.
///
/// # Examples
///
/// ```
/// # use serde::{Deserialize, Serialize};
/// # use valuefold::{CommandContext, Effect, Empty, HandlerRegistry, Message, ValueEntity};
/// # #[derive(Serialize, Deserialize)]
/// # struct Touch {}
/// # impl Message for Touch { const TYPE_TAG: &'static str = "demo.Touch"; }
/// # struct Visits;
/// # impl Visits {
/// #     fn touch(&self, s: &u64, _: Touch, ctx: &CommandContext<'_, u64>) -> Effect<u64, Empty> {
/// #         ctx.effects().update_state(s + 1).then_reply(Empty {})
/// #     }
/// # }
/// # impl ValueEntity for Visits {
/// #     const ENTITY_TYPE: &'static str = "visits";
/// #     type State = u64;
/// #     fn new(_: &str) -> Self { Visits }
/// #     fn empty_state() -> u64 { 0 }
/// #     fn handlers() -> HandlerRegistry<Self> { HandlerRegistry::new().on("Touch", Self::touch) }
/// # }
/// use valuefold::{CommandMetadata, Dispatcher};
///
/// let mut visits = Dispatcher::<Visits>::new("home").unwrap();
/// let _: Empty = visits.send(&Touch {}, &CommandMetadata::default()).unwrap();
/// assert_eq!(*visits.state(), 1);
/// ```
pub struct Dispatcher<E: ValueEntity> {
    entity_id: String,
    entity: E,
    registry: Arc<HandlerRegistry<E>>,
    state: E::State,
    version: u64,
    commands_handled: u64,
}

impl<E: ValueEntity> Dispatcher<E> {
    /// Build a dispatcher for `entity_id` in its empty state, validating
    /// the entity type's handler registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] if the registry has duplicates or no
    /// handlers.
    pub fn new(entity_id: impl Into<String>) -> Result<Self, RegistrationError> {
        let registry = Arc::new(E::handlers().validate()?);
        Ok(Self::with_registry(entity_id.into(), registry, None))
    }

    /// Build a dispatcher sharing an already validated registry, resuming
    /// from `snapshot` when one exists.
    pub(crate) fn with_registry(
        entity_id: String,
        registry: Arc<HandlerRegistry<E>>,
        snapshot: Option<Snapshot<E::State>>,
    ) -> Self {
        let entity = E::new(&entity_id);
        let (state, version, commands_handled) = match snapshot {
            Some(snap) => (snap.state, snap.version, snap.commands_handled),
            None => (E::empty_state(), 0, 0),
        };
        Self {
            entity_id,
            entity,
            registry,
            state,
            version,
            commands_handled,
        }
    }

    /// Handle one command envelope and return the reply envelope.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::UnknownCommand`] -- no handler for the type tag.
    /// * [`DispatchError::MalformedPayload`] -- the payload does not decode.
    /// * [`DispatchError::Validation`] -- the handler rejected the command.
    /// * [`DispatchError::ContractViolation`] -- the handler panicked or its
    ///   reply could not be encoded.
    ///
    /// In every error case the state is unchanged.
    pub fn handle_command(
        &mut self,
        command: &Envelope,
        metadata: &CommandMetadata,
    ) -> Result<Envelope, DispatchError> {
        let route = self.registry.route(command.type_tag()).ok_or_else(|| {
            DispatchError::UnknownCommand {
                entity_type: E::ENTITY_TYPE,
                type_tag: command.type_tag().to_owned(),
            }
        })?;
        let command_name = route.command_name;
        let command_id = self.commands_handled + 1;

        let outcome = {
            let ctx = CommandContext::new(&self.entity_id, command_name, command_id, metadata);
            (route.handler)(&self.entity, &self.state, command, &ctx)
        };

        match &outcome {
            Err(DispatchError::MalformedPayload { .. }) => {}
            Err(e @ DispatchError::ContractViolation { .. }) => {
                tracing::error!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %self.entity_id,
                    command = command_name,
                    error = %e,
                    "command handler broke its contract"
                );
                self.commands_handled = command_id;
            }
            _ => self.commands_handled = command_id,
        }

        match outcome? {
            Outcome::Rejected(message) => {
                tracing::debug!(command = command_name, %message, "command rejected");
                Err(DispatchError::Validation { message })
            }
            Outcome::Reply(reply) => Ok(reply),
            Outcome::Replace { state, reply } => {
                self.state = state;
                self.version += 1;
                Ok(reply)
            }
            Outcome::Reset { reply } => {
                self.state = E::empty_state();
                self.version += 1;
                Ok(reply)
            }
        }
    }

    /// Typed convenience over [`handle_command`](Dispatcher::handle_command):
    /// pack `command`, dispatch it, and unpack the reply as `R`.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Pack`] -- the command could not be encoded.
    /// * [`ExecuteError::Dispatch`] -- see `handle_command`.
    /// * [`ExecuteError::UnexpectedReply`] -- the reply is not an `R`.
    pub fn send<C: Message, R: Message>(
        &mut self,
        command: &C,
        metadata: &CommandMetadata,
    ) -> Result<R, ExecuteError> {
        let envelope = Envelope::pack(command).map_err(ExecuteError::Pack)?;
        let reply = self.handle_command(&envelope, metadata)?;
        reply.unpack().map_err(ExecuteError::UnexpectedReply)
    }

    /// The id of the entity instance.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// The current state.
    pub fn state(&self) -> &E::State {
        &self.state
    }

    /// Number of state replacements applied since the entity was created.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of commands that reached a handler.
    pub fn commands_handled(&self) -> u64 {
        self.commands_handled
    }

    /// The registry this dispatcher routes through.
    pub fn registry(&self) -> &HandlerRegistry<E> {
        &self.registry
    }

    /// Capture the current state for hand-off to a later dispatcher.
    pub(crate) fn snapshot(&self) -> Snapshot<E::State> {
        Snapshot {
            state: self.state.clone(),
            version: self.version,
            commands_handled: self.commands_handled,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::effect::Effect;
    use crate::entity::test_fixtures::{
        Counter, CounterState, CurrentCounter, DecreaseValue, Explode, GetCounter, IncreaseValue,
        ResetValue,
    };
    use crate::envelope::Empty;

    fn counter(id: &str) -> Dispatcher<Counter> {
        Dispatcher::<Counter>::new(id).expect("counter registry is valid")
    }

    fn meta() -> CommandMetadata {
        CommandMetadata::default()
    }

    #[test]
    fn first_command_sees_empty_state() {
        let mut d = counter("c1");
        assert_eq!(d.state(), &CounterState::default());
        let current: CurrentCounter = d.send(&GetCounter {}, &meta()).unwrap();
        assert_eq!(current, CurrentCounter { value: 0 });
        assert_eq!(d.version(), 0);
    }

    #[test]
    fn update_effect_replaces_state_once() {
        let mut d = counter("c1");
        let reply = d
            .handle_command(&Envelope::pack(&IncreaseValue { value: 10 }).unwrap(), &meta())
            .expect("increase should succeed");

        assert_eq!(reply.type_tag(), Empty::TYPE_TAG);
        assert_eq!(d.state(), &CounterState { value: 10 });
        assert_eq!(d.version(), 1);
        assert_eq!(d.commands_handled(), 1);
    }

    #[test]
    fn error_effect_leaves_state_unchanged() {
        let mut d = counter("c1");
        let _: Empty = d.send(&IncreaseValue { value: 10 }, &meta()).unwrap();

        let err = d
            .send::<_, Empty>(&IncreaseValue { value: -1 }, &meta())
            .unwrap_err();
        assert_eq!(
            err.validation_message(),
            Some("Increase requires a positive value. It was [-1].")
        );
        assert_eq!(d.state(), &CounterState { value: 10 });
        assert_eq!(d.version(), 1);
        // The rejected command still reached its handler.
        assert_eq!(d.commands_handled(), 2);
    }

    #[test]
    fn read_command_never_changes_state() {
        let mut d = counter("c1");
        let _: Empty = d.send(&IncreaseValue { value: 6 }, &meta()).unwrap();
        for _ in 0..5 {
            let current: CurrentCounter = d.send(&GetCounter {}, &meta()).unwrap();
            assert_eq!(current.value, 6);
        }
        assert_eq!(d.version(), 1);
        assert_eq!(d.state(), &CounterState { value: 6 });
    }

    #[test]
    fn unknown_type_tag_is_rejected_before_any_handler() {
        let mut d = counter("c1");
        let _: Empty = d.send(&IncreaseValue { value: 3 }, &meta()).unwrap();

        let err = d
            .handle_command(&Envelope::new("test.Unregistered", b"{}".to_vec()), &meta())
            .unwrap_err();
        assert!(
            matches!(
                err,
                DispatchError::UnknownCommand {
                    entity_type: "counter",
                    ref type_tag,
                } if type_tag == "test.Unregistered"
            ),
            "unexpected error: {err:?}"
        );
        assert_eq!(d.state(), &CounterState { value: 3 });
        assert_eq!(d.commands_handled(), 1);
    }

    #[test]
    fn malformed_payload_never_reaches_handler() {
        let mut d = counter("c1");
        let bad = Envelope::new(IncreaseValue::TYPE_TAG, b"{\"value\": \"ten\"}".to_vec());
        let err = d.handle_command(&bad, &meta()).unwrap_err();

        assert!(
            matches!(
                err,
                DispatchError::MalformedPayload {
                    command_name: "Increase",
                    ..
                }
            ),
            "unexpected error: {err:?}"
        );
        assert!(err.is_fault());
        assert_eq!(d.state(), &CounterState::default());
        assert_eq!(d.commands_handled(), 0);
    }

    #[test]
    fn panicking_handler_is_a_contract_violation() {
        let mut d = counter("c1");
        let _: Empty = d.send(&IncreaseValue { value: 2 }, &meta()).unwrap();

        let err = d.send::<_, Empty>(&Explode {}, &meta()).unwrap_err();
        match err {
            ExecuteError::Dispatch(DispatchError::ContractViolation {
                command_name,
                reason,
            }) => {
                assert_eq!(command_name, "Explode");
                assert!(reason.contains("handler blew up"), "reason: {reason}");
            }
            other => panic!("expected ContractViolation, got {other:?}"),
        }
        assert_eq!(d.state(), &CounterState { value: 2 });

        // The dispatcher keeps working after a fault.
        let _: Empty = d.send(&DecreaseValue { value: 1 }, &meta()).unwrap();
        assert_eq!(d.state(), &CounterState { value: 1 });
    }

    #[test]
    fn reply_of_wrong_type_is_reported_to_caller() {
        let mut d = counter("c1");
        let err = d.send::<_, CurrentCounter>(&ResetValue {}, &meta()).unwrap_err();
        assert!(matches!(err, ExecuteError::UnexpectedReply(_)));
    }

    #[test]
    fn context_carries_entity_id_and_command_ids() {
        #[derive(Serialize, Deserialize)]
        struct WhoAmI {}
        impl Message for WhoAmI {
            const TYPE_TAG: &'static str = "test.WhoAmI";
        }
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Identity {
            entity_id: String,
            command_name: String,
            command_id: u64,
            actor: Option<String>,
        }
        impl Message for Identity {
            const TYPE_TAG: &'static str = "test.Identity";
        }

        struct Echo;
        impl Echo {
            fn who(&self, _: &(), _: WhoAmI, ctx: &CommandContext<'_, ()>) -> Effect<(), Identity> {
                ctx.effects().reply(Identity {
                    entity_id: ctx.entity_id().to_owned(),
                    command_name: ctx.command_name().to_owned(),
                    command_id: ctx.command_id(),
                    actor: ctx.metadata().actor.clone(),
                })
            }
        }
        impl ValueEntity for Echo {
            const ENTITY_TYPE: &'static str = "echo";
            type State = ();
            fn new(_: &str) -> Self {
                Echo
            }
            fn empty_state() {}
            fn handlers() -> HandlerRegistry<Self> {
                HandlerRegistry::new().on("WhoAmI", Self::who)
            }
        }

        let mut d = Dispatcher::<Echo>::new("e-7").unwrap();
        let meta = CommandMetadata::default().with_actor("alice");
        let _: Identity = d.send(&WhoAmI {}, &meta).unwrap();
        let second: Identity = d.send(&WhoAmI {}, &meta).unwrap();
        assert_eq!(
            second,
            Identity {
                entity_id: "e-7".into(),
                command_name: "WhoAmI".into(),
                command_id: 2,
                actor: Some("alice".into()),
            }
        );
    }

    #[test]
    fn delete_state_returns_to_empty_state() {
        #[derive(Serialize, Deserialize)]
        struct Append {
            item: String,
        }
        impl Message for Append {
            const TYPE_TAG: &'static str = "test.Append";
        }
        #[derive(Serialize, Deserialize)]
        struct Clear {}
        impl Message for Clear {
            const TYPE_TAG: &'static str = "test.Clear";
        }

        struct Basket;
        impl Basket {
            fn append(
                &self,
                items: &Vec<String>,
                cmd: Append,
                ctx: &CommandContext<'_, Vec<String>>,
            ) -> Effect<Vec<String>, Empty> {
                let mut next = items.clone();
                next.push(cmd.item);
                ctx.effects().update_state(next).then_reply(Empty {})
            }
            fn clear(
                &self,
                _: &Vec<String>,
                _: Clear,
                ctx: &CommandContext<'_, Vec<String>>,
            ) -> Effect<Vec<String>, Empty> {
                ctx.effects().delete_state().then_reply(Empty {})
            }
        }
        impl ValueEntity for Basket {
            const ENTITY_TYPE: &'static str = "basket";
            type State = Vec<String>;
            fn new(_: &str) -> Self {
                Basket
            }
            fn empty_state() -> Vec<String> {
                Vec::new()
            }
            fn handlers() -> HandlerRegistry<Self> {
                HandlerRegistry::new()
                    .on("Append", Self::append)
                    .on("Clear", Self::clear)
            }
        }

        let mut d = Dispatcher::<Basket>::new("b-1").unwrap();
        let _: Empty = d.send(&Append { item: "apple".into() }, &meta()).unwrap();
        assert_eq!(d.state(), &vec!["apple".to_string()]);
        let _: Empty = d.send(&Clear {}, &meta()).unwrap();
        assert!(d.state().is_empty());
        assert_eq!(d.version(), 2);
    }

    #[test]
    fn unencodable_reply_discards_the_update() {
        use std::collections::HashMap;

        #[derive(Serialize, Deserialize)]
        struct Bump {}
        impl Message for Bump {
            const TYPE_TAG: &'static str = "test.Bump";
        }
        // JSON object keys must be strings, so tuple keys fail to encode.
        #[derive(Serialize, Deserialize)]
        struct Grid {
            cells: HashMap<(u8, u8), u8>,
        }
        impl Message for Grid {
            const TYPE_TAG: &'static str = "test.Grid";
        }

        struct Board;
        impl Board {
            fn bump(&self, n: &u32, _: Bump, ctx: &CommandContext<'_, u32>) -> Effect<u32, Grid> {
                let cells = HashMap::from([((0, 0), 1)]);
                ctx.effects().update_state(n + 1).then_reply(Grid { cells })
            }
        }
        impl ValueEntity for Board {
            const ENTITY_TYPE: &'static str = "board";
            type State = u32;
            fn new(_: &str) -> Self {
                Board
            }
            fn empty_state() -> u32 {
                0
            }
            fn handlers() -> HandlerRegistry<Self> {
                HandlerRegistry::new().on("Bump", Self::bump)
            }
        }

        let mut d = Dispatcher::<Board>::new("g-1").unwrap();
        let err = d
            .handle_command(&Envelope::pack(&Bump {}).unwrap(), &meta())
            .unwrap_err();
        assert!(
            matches!(
                err,
                DispatchError::ContractViolation {
                    command_name: "Bump",
                    ref reason,
                } if reason.starts_with("reply could not be encoded")
            ),
            "unexpected error: {err:?}"
        );
        assert!(err.is_fault());
        assert_eq!(d.state(), &0);
        assert_eq!(d.version(), 0);
    }

    #[test]
    fn snapshot_resumes_where_it_left_off() {
        let mut d = counter("c1");
        let _: Empty = d.send(&IncreaseValue { value: 4 }, &meta()).unwrap();
        let snap = d.snapshot();

        let registry = Arc::new(Counter::handlers().validate().unwrap());
        let mut resumed = Dispatcher::with_registry("c1".into(), registry, Some(snap));
        assert_eq!(resumed.state(), &CounterState { value: 4 });
        assert_eq!(resumed.version(), 1);
        let _: Empty = resumed.send(&IncreaseValue { value: 1 }, &meta()).unwrap();
        assert_eq!(resumed.state(), &CounterState { value: 5 });
        assert_eq!(resumed.commands_handled(), 2);
    }
}
