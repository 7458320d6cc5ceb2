//! Top-level entry point that composes entity-type registration, actor
//! spawning, and handle caching into a single [`EntityStore`] type.
//!
//! The store is opened via [`EntityStoreBuilder`], which validates every
//! registered entity type's handler registry up front. After `open()` the
//! set of entity types and their handlers is fixed.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::actor::{ActorConfig, DEFAULT_MAILBOX_CAPACITY, EntityHandle, spawn_actor_with_config};
use crate::command::{CommandEnvelope, CommandMetadata};
use crate::entity::{HandlerRegistry, ValueEntity};
use crate::envelope::{Envelope, Message};
use crate::error::{ExecuteError, RegistrationError, StateError};
use crate::snapshot::SnapshotMap;

/// Type-erased handle cache keyed by `(TypeId, entity_id)`.
///
/// `TypeId` identifies the entity type at runtime; the `String` is the
/// entity id. `Arc<dyn Any + Send + Sync>` lets a single map hold
/// `EntityHandle<E>` for any concrete `E`, and lets entries be cloned out
/// of the lock. Downcasting recovers the typed handle.
type HandleCache = HashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>;

/// Type-erased routers keyed by entity type name.
type RouterMap = HashMap<&'static str, Box<dyn EntityRouter>>;

/// Default idle timeout for actors: 5 minutes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Boxed future returned by [`EntityRouter::dispatch`].
type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<Envelope, ExecuteError>> + Send + 'a>>;

/// Central registry that manages entity instance lifecycles.
///
/// Routes commands to one actor per `(entity type, entity id)`, spawning
/// actors on first use and again after they idle out. State survives the
/// restart through an in-memory snapshot map per entity type.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct EntityStore {
    cache: Arc<RwLock<HandleCache>>,
    routers: Arc<RouterMap>,
    config: ActorConfig,
}

// Manual `Debug` because `dyn Any` is not `Debug` and we don't want to
// expose cache internals.
impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("entity_types", &self.entity_types())
            .field("idle_timeout", &self.config.idle_timeout)
            .field("mailbox_capacity", &self.config.mailbox_capacity)
            .finish()
    }
}

impl EntityStore {
    /// Shorthand for [`EntityStoreBuilder::new`].
    pub fn builder() -> EntityStoreBuilder {
        EntityStoreBuilder::new()
    }

    /// Get a handle to an entity instance, spawning its actor if needed.
    ///
    /// If the actor is already running (cached and alive), returns a clone
    /// of the existing handle. Otherwise spawns a new actor that resumes
    /// from the entity's latest snapshot, or from
    /// [`empty_state`](ValueEntity::empty_state) for an unseen id.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::UnknownEntityType`] if `E` was not registered
    /// with the builder.
    pub async fn get<E: ValueEntity>(&self, id: &str) -> Result<EntityHandle<E>, ExecuteError> {
        let registration = self.registration::<E>()?;
        let key = (TypeId::of::<E>(), id.to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(handle) = live_handle::<E>(&cache, &key) {
                return Ok(handle);
            }
        }

        // Slow path: re-check and spawn under the write lock so concurrent
        // callers never start two actors for the same id.
        loop {
            let retiring = {
                let mut cache = self.cache.write().await;
                let cached = cache
                    .get(&key)
                    .and_then(|erased| erased.downcast_ref::<EntityHandle<E>>())
                    .cloned();
                match cached {
                    Some(handle) if handle.is_alive() => return Ok(handle),
                    // The stale entry stays cached so every caller waits on
                    // it instead of spawning early.
                    Some(handle) if !handle.has_stopped() => handle,
                    _ => {
                        tracing::debug!(
                            entity_type = E::ENTITY_TYPE,
                            entity_id = %id,
                            "spawning actor"
                        );
                        let handle = spawn_actor_with_config::<E>(
                            id,
                            Arc::clone(&registration.registry),
                            registration.snapshots.clone(),
                            self.config.clone(),
                        );
                        cache.insert(key, Arc::new(handle.clone()));
                        return Ok(handle);
                    }
                }
            };

            // A retiring actor may still be finishing queued commands. Its
            // final snapshot must land before the replacement loads it.
            retiring.stopped().await;
        }
    }

    /// Execute a command envelope against entity `id` of type `E`.
    ///
    /// If the cached actor exits between lookup and delivery, the command
    /// was never accepted and is sent once more to a freshly spawned actor.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::UnknownEntityType`] -- `E` is not registered.
    /// * [`ExecuteError::Dispatch`] -- the command was rejected or faulted.
    /// * [`ExecuteError::ActorGone`] -- the actor exited twice in a row.
    pub async fn execute<E: ValueEntity>(
        &self,
        id: &str,
        command: Envelope,
        metadata: CommandMetadata,
    ) -> Result<Envelope, ExecuteError> {
        let handle = self.get::<E>(id).await?;
        let reply = match handle.deliver(command, metadata).await {
            Ok(reply) => reply,
            Err((command, metadata)) => {
                tracing::debug!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %id,
                    "actor exited before delivery, retrying"
                );
                let handle = self.get::<E>(id).await?;
                handle
                    .deliver(command, metadata)
                    .await
                    .map_err(|_| ExecuteError::ActorGone)?
            }
        };
        let result = reply.await.map_err(|_| ExecuteError::ActorGone)?;
        Ok(result?)
    }

    /// Typed convenience over [`execute`](EntityStore::execute): pack
    /// `command`, execute it, and unpack the reply as `R`.
    ///
    /// # Errors
    ///
    /// As [`execute`](EntityStore::execute), plus [`ExecuteError::Pack`]
    /// and [`ExecuteError::UnexpectedReply`] from the codec.
    pub async fn send<E: ValueEntity, C: Message, R: Message>(
        &self,
        id: &str,
        command: &C,
        metadata: CommandMetadata,
    ) -> Result<R, ExecuteError> {
        let envelope = Envelope::pack(command).map_err(ExecuteError::Pack)?;
        let reply = self.execute::<E>(id, envelope, metadata).await?;
        reply.unpack().map_err(ExecuteError::UnexpectedReply)
    }

    /// Route a [`CommandEnvelope`] to its entity type by name.
    ///
    /// This is the transport-neutral entry point: the caller needs only
    /// the entity type name, the entity id, and a tagged command.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::UnknownEntityType`] if no entity type with
    /// `envelope.entity_type` is registered, otherwise as
    /// [`execute`](EntityStore::execute).
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Result<Envelope, ExecuteError> {
        let router = self
            .routers
            .get(envelope.entity_type.as_str())
            .ok_or_else(|| ExecuteError::UnknownEntityType(envelope.entity_type.clone()))?;
        router.dispatch(self, envelope).await
    }

    /// Read a copy of the current state of entity `id`.
    ///
    /// Spawns the actor if needed, so an unseen id reports its empty state.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::UnknownEntityType`] if `E` is not registered,
    /// or [`ExecuteError::ActorGone`] if the actor exited mid-request.
    pub async fn state<E: ValueEntity>(&self, id: &str) -> Result<E::State, ExecuteError> {
        let handle = self.get::<E>(id).await?;
        match handle.state().await {
            Ok(state) => Ok(state),
            Err(StateError::ActorGone) => {
                tracing::debug!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %id,
                    "actor exited before read, retrying"
                );
                let handle = self.get::<E>(id).await?;
                handle
                    .state()
                    .await
                    .map_err(|StateError::ActorGone| ExecuteError::ActorGone)
            }
        }
    }

    /// Names of the registered entity types, sorted.
    pub fn entity_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.routers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Number of cached actors that are still running.
    pub async fn live_actors(&self) -> usize {
        let cache = self.cache.read().await;
        let mut live = 0;
        for erased in cache.values() {
            if self.routers.values().any(|router| router.is_alive(&**erased)) {
                live += 1;
            }
        }
        live
    }

    /// Ask every cached actor to stop and wait until all have saved their
    /// final state. Later calls spawn fresh actors as needed.
    pub async fn shutdown(&self) {
        // Stopped handles stay cached; `get` replaces them once their final
        // snapshot is saved.
        let handles: Vec<_> = self.cache.read().await.values().cloned().collect();
        for erased in handles {
            for router in self.routers.values() {
                if router.shutdown(&*erased).await {
                    break;
                }
            }
        }
    }

    fn registration<E: ValueEntity>(&self) -> Result<&Registration<E>, ExecuteError> {
        self.routers
            .get(E::ENTITY_TYPE)
            .and_then(|router| router.as_any().downcast_ref::<Registration<E>>())
            .ok_or_else(|| ExecuteError::UnknownEntityType(E::ENTITY_TYPE.to_owned()))
    }
}

/// Clone the cached handle for `key` if its actor is still running.
fn live_handle<E: ValueEntity>(
    cache: &HandleCache,
    key: &(TypeId, String),
) -> Option<EntityHandle<E>> {
    if let Some(erased) = cache.get(key)
        && let Some(handle) = erased.downcast_ref::<EntityHandle<E>>()
        && handle.is_alive()
    {
        return Some(handle.clone());
    }
    None
}

// --- Type-erased routing by entity type name ---

/// Type-erased interface for one registered entity type.
///
/// Each concrete `Registration<E>` implements this trait so the store can
/// route [`CommandEnvelope`]s by name and manage cached handles without
/// knowing `E`.
trait EntityRouter: Send + Sync {
    /// Execute the envelope's command against the addressed instance.
    fn dispatch<'a>(
        &'a self,
        store: &'a EntityStore,
        envelope: CommandEnvelope,
    ) -> DispatchFuture<'a>;

    /// Whether `handle` is a running `EntityHandle` of this type.
    fn is_alive(&self, handle: &(dyn Any + Send + Sync)) -> bool;

    /// Shut down `handle` if it belongs to this type; returns whether it
    /// did.
    fn shutdown<'a>(
        &'a self,
        handle: &'a (dyn Any + Send + Sync),
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    fn as_any(&self) -> &dyn Any;
}

/// Everything the store keeps for one entity type `E`: its validated
/// handler registry and the snapshots of its instances.
struct Registration<E: ValueEntity> {
    registry: Arc<HandlerRegistry<E>>,
    snapshots: SnapshotMap<E::State>,
}

impl<E: ValueEntity> EntityRouter for Registration<E> {
    fn dispatch<'a>(
        &'a self,
        store: &'a EntityStore,
        envelope: CommandEnvelope,
    ) -> DispatchFuture<'a> {
        Box::pin(async move {
            let CommandEnvelope {
                entity_id,
                command,
                metadata,
                ..
            } = envelope;
            store.execute::<E>(&entity_id, command, metadata).await
        })
    }

    fn is_alive(&self, handle: &(dyn Any + Send + Sync)) -> bool {
        handle
            .downcast_ref::<EntityHandle<E>>()
            .is_some_and(EntityHandle::is_alive)
    }

    fn shutdown<'a>(
        &'a self,
        handle: &'a (dyn Any + Send + Sync),
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let Some(handle) = handle.downcast_ref::<EntityHandle<E>>() else {
                return false;
            };
            handle.shutdown().await;
            handle.stopped().await;
            true
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// --- Factory types for deferred construction ---

/// Factory for creating a type-erased entity registration.
type RegistrationFactory = Box<dyn FnOnce() -> Result<Box<dyn EntityRouter>, RegistrationError>>;

/// Builder for configuring and opening an [`EntityStore`].
///
/// Collects the registered entity types and the actor settings, then
/// validates all handler registries on [`open`](EntityStoreBuilder::open).
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use valuefold::{EntityStoreBuilder, RegistrationError};
///
/// # fn example() -> Result<(), RegistrationError> {
/// let store = EntityStoreBuilder::new()
///     .idle_timeout(Duration::from_secs(60))
///     .open()?;
/// # Ok(())
/// # }
/// ```
pub struct EntityStoreBuilder {
    factories: Vec<(&'static str, RegistrationFactory)>,
    idle_timeout: Option<Duration>,
    mailbox_capacity: usize,
}

impl EntityStoreBuilder {
    /// Create a new builder with no entity types and default settings.
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    /// Register an entity type.
    ///
    /// The entity's [`handlers`](ValueEntity::handlers) are built once,
    /// when [`open`](EntityStoreBuilder::open) is called, and shared by
    /// every instance afterwards.
    ///
    /// # Type Parameters
    ///
    /// * `E` - A type implementing [`ValueEntity`].
    pub fn entity_type<E: ValueEntity>(mut self) -> Self {
        self.factories.push((
            E::ENTITY_TYPE,
            Box::new(|| {
                let registry = E::handlers().validate()?;
                Ok(Box::new(Registration::<E> {
                    registry: Arc::new(registry),
                    snapshots: SnapshotMap::new(),
                }) as Box<dyn EntityRouter>)
            }),
        ));
        self
    }

    /// Set how long an idle actor waits for a message before shutting
    /// down. Defaults to [`DEFAULT_IDLE_TIMEOUT`].
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Keep actors running until the store shuts them down.
    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Set the bound of each actor's mailbox. Values below 1 are raised
    /// to 1.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Validate every registered entity type and build the
    /// [`EntityStore`].
    ///
    /// # Errors
    ///
    /// Returns the first [`RegistrationError`] found: a handler registry
    /// with a duplicate type tag or command name, one with no handlers, or
    /// two entity types sharing a name.
    pub fn open(self) -> Result<EntityStore, RegistrationError> {
        let mut routers: RouterMap = HashMap::new();
        for (name, factory) in self.factories {
            if routers.contains_key(name) {
                return Err(RegistrationError::DuplicateEntityType(name));
            }
            routers.insert(name, factory()?);
        }

        Ok(EntityStore {
            cache: Arc::new(RwLock::new(HashMap::new())),
            routers: Arc::new(routers),
            config: ActorConfig {
                idle_timeout: self.idle_timeout,
                mailbox_capacity: self.mailbox_capacity,
            },
        })
    }
}

impl Default for EntityStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
