//! The `ValueEntity` trait and its command handler registry.

use std::collections::HashMap;
use std::fmt;

use crate::command::CommandContext;
use crate::dispatcher::{ErasedHandler, typed_handler};
use crate::effect::Effect;
use crate::envelope::Message;
use crate::error::RegistrationError;

/// Business logic for one entity type.
///
/// One value of the implementing type is created per entity instance via
/// [`new`](ValueEntity::new) and holds nothing but the immutable entity id.
/// The state lives in [`State`](ValueEntity::State) and is owned by the
/// runtime; handlers receive it by shared reference and describe any change
/// through the returned [`Effect`].
///
/// # Contract
///
/// - [`empty_state`](ValueEntity::empty_state) must be pure. It supplies the
///   state observed by the first command ever sent to an unseen id.
/// - [`handlers`](ValueEntity::handlers) is called once, when the entity type
///   is registered. The registry it returns is immutable afterwards.
/// - Handlers must be synchronous and non-blocking. They validate first and
///   return `ctx.effects().error(..)` before building any new state.
pub trait ValueEntity: Sized + Send + Sync + 'static {
    /// Identifies this entity type (e.g. `"counter"`).
    const ENTITY_TYPE: &'static str;

    /// The persisted value of one entity instance.
    type State: Clone + Send + Sync + 'static;

    /// Build the handler object for instance `entity_id`.
    fn new(entity_id: &str) -> Self;

    /// The state of an entity that has never handled a command.
    fn empty_state() -> Self::State;

    /// The mapping from command type tag to handler function.
    fn handlers() -> HandlerRegistry<Self>;
}

/// Registered handler for one command type.
pub(crate) struct Route<E: ValueEntity> {
    pub(crate) command_name: &'static str,
    pub(crate) handler: ErasedHandler<E>,
}

/// Immutable mapping from command type tag to handler function for one
/// entity type.
///
/// Built with chained [`on`](HandlerRegistry::on) calls. Registration
/// mistakes (a type tag or command name registered twice, or no handlers at
/// all) are collected and reported when the entity type is registered with
/// [`EntityStoreBuilder::open`](crate::EntityStoreBuilder::open).
///
/// # Examples
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use valuefold::{CommandContext, Effect, Empty, HandlerRegistry, Message, ValueEntity};
///
/// #[derive(Serialize, Deserialize)]
/// struct Touch {}
///
/// impl Message for Touch {
///     const TYPE_TAG: &'static str = "demo.Touch";
/// }
///
/// struct Visits;
///
/// impl Visits {
///     fn touch(
///         &self,
///         state: &u64,
///         _cmd: Touch,
///         ctx: &CommandContext<'_, u64>,
///     ) -> Effect<u64, Empty> {
///         ctx.effects().update_state(state + 1).then_reply(Empty {})
///     }
/// }
///
/// impl ValueEntity for Visits {
///     const ENTITY_TYPE: &'static str = "visits";
///     type State = u64;
///
///     fn new(_entity_id: &str) -> Self {
///         Visits
///     }
///
///     fn empty_state() -> u64 {
///         0
///     }
///
///     fn handlers() -> HandlerRegistry<Self> {
///         HandlerRegistry::new().on("Touch", Self::touch)
///     }
/// }
///
/// let registry = Visits::handlers();
/// assert_eq!(registry.command_names(), vec!["Touch"]);
/// ```
pub struct HandlerRegistry<E: ValueEntity> {
    routes: HashMap<&'static str, Route<E>>,
    problems: Vec<RegistrationError>,
}

impl<E: ValueEntity> HandlerRegistry<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            problems: Vec::new(),
        }
    }

    /// Register `handler` under `command_name` for commands tagged
    /// `C::TYPE_TAG`, replying with `R`.
    ///
    /// # Type Parameters
    ///
    /// * `C` - The command message the handler decodes.
    /// * `R` - The reply message the handler returns.
    pub fn on<C, R, F>(mut self, command_name: &'static str, handler: F) -> Self
    where
        C: Message,
        R: Message,
        F: Fn(&E, &E::State, C, &CommandContext<'_, E::State>) -> Effect<E::State, R>
            + Send
            + Sync
            + 'static,
    {
        if self.routes.contains_key(C::TYPE_TAG) {
            self.problems.push(RegistrationError::DuplicateTypeTag {
                entity_type: E::ENTITY_TYPE,
                type_tag: C::TYPE_TAG,
            });
            return self;
        }
        if self.routes.values().any(|r| r.command_name == command_name) {
            self.problems.push(RegistrationError::DuplicateCommandName {
                entity_type: E::ENTITY_TYPE,
                command_name,
            });
            return self;
        }
        self.routes.insert(
            C::TYPE_TAG,
            Route {
                command_name,
                handler: typed_handler::<E, C, R, F>(command_name, handler),
            },
        );
        self
    }

    /// Names of all registered commands, sorted.
    pub fn command_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.routes.values().map(|r| r.command_name).collect();
        names.sort_unstable();
        names
    }

    /// Type tags of all registered commands, sorted.
    pub fn type_tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.routes.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if no command is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn route(&self, type_tag: &str) -> Option<&Route<E>> {
        self.routes.get(type_tag)
    }

    /// Check the registry is usable: no duplicates, at least one command.
    pub(crate) fn validate(mut self) -> Result<Self, RegistrationError> {
        if !self.problems.is_empty() {
            return Err(self.problems.swap_remove(0));
        }
        if self.routes.is_empty() {
            return Err(RegistrationError::EmptyRegistry {
                entity_type: E::ENTITY_TYPE,
            });
        }
        Ok(self)
    }
}

impl<E: ValueEntity> Default for HandlerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ValueEntity> fmt::Debug for HandlerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("commands", &self.command_names())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};

    use super::{HandlerRegistry, ValueEntity};
    use crate::command::CommandContext;
    use crate::effect::Effect;
    use crate::envelope::{Empty, Message};

    /// Persisted state of the `Counter` entity.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct CounterState {
        pub value: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) struct IncreaseValue {
        pub value: i64,
    }

    impl Message for IncreaseValue {
        const TYPE_TAG: &'static str = "test.IncreaseValue";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) struct DecreaseValue {
        pub value: i64,
    }

    impl Message for DecreaseValue {
        const TYPE_TAG: &'static str = "test.DecreaseValue";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) struct ResetValue {}

    impl Message for ResetValue {
        const TYPE_TAG: &'static str = "test.ResetValue";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) struct GetCounter {}

    impl Message for GetCounter {
        const TYPE_TAG: &'static str = "test.GetCounter";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct CurrentCounter {
        pub value: i64,
    }

    impl Message for CurrentCounter {
        const TYPE_TAG: &'static str = "test.CurrentCounter";
    }

    /// Panics on purpose so fault handling can be tested.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) struct Explode {}

    impl Message for Explode {
        const TYPE_TAG: &'static str = "test.Explode";
    }

    /// A simple counter entity used as a test fixture.
    pub(crate) struct Counter {
        #[allow(dead_code)]
        entity_id: String,
    }

    impl Counter {
        pub(crate) fn increase(
            &self,
            state: &CounterState,
            cmd: IncreaseValue,
            ctx: &CommandContext<'_, CounterState>,
        ) -> Effect<CounterState, Empty> {
            if cmd.value < 0 {
                return ctx.effects().error(format!(
                    "Increase requires a positive value. It was [{}].",
                    cmd.value
                ));
            }
            let new_state = CounterState {
                value: state.value + cmd.value,
            };
            ctx.effects().update_state(new_state).then_reply(Empty {})
        }

        pub(crate) fn decrease(
            &self,
            state: &CounterState,
            cmd: DecreaseValue,
            ctx: &CommandContext<'_, CounterState>,
        ) -> Effect<CounterState, Empty> {
            if cmd.value < 0 {
                return ctx.effects().error(format!(
                    "Decrease requires a positive value. It was [{}].",
                    cmd.value
                ));
            }
            let new_state = CounterState {
                value: state.value - cmd.value,
            };
            ctx.effects().update_state(new_state).then_reply(Empty {})
        }

        pub(crate) fn reset(
            &self,
            _state: &CounterState,
            _cmd: ResetValue,
            ctx: &CommandContext<'_, CounterState>,
        ) -> Effect<CounterState, Empty> {
            ctx.effects()
                .update_state(CounterState { value: 0 })
                .then_reply(Empty {})
        }

        pub(crate) fn get_current_counter(
            &self,
            state: &CounterState,
            _cmd: GetCounter,
            ctx: &CommandContext<'_, CounterState>,
        ) -> Effect<CounterState, CurrentCounter> {
            ctx.effects().reply(CurrentCounter { value: state.value })
        }

        pub(crate) fn explode(
            &self,
            _state: &CounterState,
            _cmd: Explode,
            _ctx: &CommandContext<'_, CounterState>,
        ) -> Effect<CounterState, Empty> {
            panic!("handler blew up")
        }
    }

    impl ValueEntity for Counter {
        const ENTITY_TYPE: &'static str = "counter";
        type State = CounterState;

        fn new(entity_id: &str) -> Self {
            Self {
                entity_id: entity_id.to_owned(),
            }
        }

        fn empty_state() -> CounterState {
            CounterState::default()
        }

        fn handlers() -> HandlerRegistry<Self> {
            HandlerRegistry::new()
                .on("Increase", Self::increase)
                .on("Decrease", Self::decrease)
                .on("Reset", Self::reset)
                .on("GetCurrentCounter", Self::get_current_counter)
                .on("Explode", Self::explode)
        }
    }
}
