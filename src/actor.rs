//! Actor loop that owns one entity instance and processes its commands.
//!
//! The actor runs as a tokio task and sequentially processes messages from
//! an `mpsc` channel. It exclusively owns the entity's [`Dispatcher`], so
//! commands for one entity id never overlap, while actors for different ids
//! run in parallel.
//!
//! Public API: [`EntityHandle`] (cloneable async handle) and
//! [`spawn_actor`] (standalone factory outside an
//! [`EntityStore`](crate::EntityStore)).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::command::CommandMetadata;
use crate::dispatcher::Dispatcher;
use crate::entity::{HandlerRegistry, ValueEntity};
use crate::envelope::{Envelope, Message};
use crate::error::{DispatchError, ExecuteError, RegistrationError, StateError};
use crate::snapshot::SnapshotMap;

/// Default mailbox size for each actor.
pub(crate) const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Configuration for the actor loop.
///
/// Internal to the crate -- callers configure it through
/// [`EntityStoreBuilder`](crate::EntityStoreBuilder).
#[derive(Debug, Clone)]
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    /// `None` means the actor never idles out.
    pub idle_timeout: Option<Duration>,
    /// Bound of the actor's mailbox.
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult = Result<Envelope, DispatchError>;

/// Messages sent from `EntityHandle` to the actor loop.
pub(crate) enum ActorMessage<E: ValueEntity> {
    /// Dispatch a command against the entity.
    Execute {
        /// The tagged, serialized command.
        command: Envelope,
        /// Caller metadata forwarded to the handler.
        metadata: CommandMetadata,
        /// Channel to send back the reply envelope or an error.
        reply: oneshot::Sender<ExecuteResult>,
    },

    /// Retrieve a copy of the current entity state.
    GetState {
        /// Channel to send back the state.
        reply: oneshot::Sender<E::State>,
    },

    /// Gracefully shut down the actor loop.
    Shutdown,
}

/// Runs the entity actor loop.
///
/// The loop exits when the channel closes (all senders dropped), a
/// `Shutdown` message is received, or the idle timeout elapses. On exit the
/// mailbox is closed, any messages already queued are still processed, and
/// the final state is saved to `snapshots` before `stopped` is raised.
pub(crate) async fn run_actor<E: ValueEntity>(
    mut dispatcher: Dispatcher<E>,
    mut rx: mpsc::Receiver<ActorMessage<E>>,
    snapshots: SnapshotMap<E::State>,
    stopped: watch::Sender<bool>,
    config: ActorConfig,
) {
    loop {
        let msg = match config.idle_timeout {
            Some(idle_timeout) => match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(msg) => msg,
                Err(_elapsed) => {
                    tracing::info!(
                        entity_type = E::ENTITY_TYPE,
                        entity_id = %dispatcher.entity_id(),
                        "actor idle, shutting down"
                    );
                    break;
                }
            },
            None => rx.recv().await,
        };

        match msg {
            Some(ActorMessage::Shutdown) | None => break,
            Some(msg) => handle_message(&mut dispatcher, &snapshots, msg),
        }
    }

    // Refuse new messages, then finish the ones that were already accepted
    // so no caller is left without a reply.
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        handle_message(&mut dispatcher, &snapshots, msg);
    }

    snapshots.save(dispatcher.entity_id(), dispatcher.snapshot());
    let _ = stopped.send(true);
}

fn handle_message<E: ValueEntity>(
    dispatcher: &mut Dispatcher<E>,
    snapshots: &SnapshotMap<E::State>,
    msg: ActorMessage<E>,
) {
    match msg {
        ActorMessage::Execute {
            command,
            metadata,
            reply,
        } => {
            let result = execute_command(dispatcher, snapshots, &command, &metadata);
            // If the receiver was dropped, the caller no longer cares
            // about the result. Silently discard it.
            let _ = reply.send(result);
        }
        ActorMessage::GetState { reply } => {
            let _ = reply.send(dispatcher.state().clone());
        }
        ActorMessage::Shutdown => {}
    }
}

/// Execute a single command and record the new state if it changed.
fn execute_command<E: ValueEntity>(
    dispatcher: &mut Dispatcher<E>,
    snapshots: &SnapshotMap<E::State>,
    command: &Envelope,
    metadata: &CommandMetadata,
) -> ExecuteResult {
    let _span = tracing::info_span!(
        "execute",
        entity_type = E::ENTITY_TYPE,
        entity_id = %dispatcher.entity_id(),
        command = command.type_tag(),
    )
    .entered();

    let before = dispatcher.version();
    let result = dispatcher.handle_command(command, metadata);

    if dispatcher.version() != before {
        snapshots.save(dispatcher.entity_id(), dispatcher.snapshot());
        tracing::debug!(version = dispatcher.version(), "state updated");
    }

    result
}

/// Async handle to a running entity actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the actor
/// task over a bounded channel.
///
/// # Type Parameters
///
/// * `E` - The [`ValueEntity`] type this handle addresses.
pub struct EntityHandle<E: ValueEntity> {
    entity_id: Arc<str>,
    sender: mpsc::Sender<ActorMessage<E>>,
    stopped: watch::Receiver<bool>,
}

// Manual `Clone` because `E` itself need not be `Clone` for the handle.
impl<E: ValueEntity> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            entity_id: Arc::clone(&self.entity_id),
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<E: ValueEntity> std::fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("entity_id", &self.entity_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<E: ValueEntity> EntityHandle<E> {
    /// Send a command envelope to the entity and wait for the reply.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Dispatch`] -- the command was rejected or faulted.
    /// * [`ExecuteError::ActorGone`] -- the actor task has exited.
    pub async fn execute(
        &self,
        command: Envelope,
        metadata: CommandMetadata,
    ) -> Result<Envelope, ExecuteError> {
        let rx = self
            .deliver(command, metadata)
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        let result = rx.await.map_err(|_| ExecuteError::ActorGone)?;
        Ok(result?)
    }

    /// Typed convenience over [`execute`](EntityHandle::execute): pack
    /// `command`, send it, and unpack the reply as `R`.
    ///
    /// # Errors
    ///
    /// As [`execute`](EntityHandle::execute), plus [`ExecuteError::Pack`]
    /// and [`ExecuteError::UnexpectedReply`] from the codec.
    pub async fn send<C: Message, R: Message>(
        &self,
        command: &C,
        metadata: CommandMetadata,
    ) -> Result<R, ExecuteError> {
        let envelope = Envelope::pack(command).map_err(ExecuteError::Pack)?;
        let reply = self.execute(envelope, metadata).await?;
        reply.unpack().map_err(ExecuteError::UnexpectedReply)
    }

    /// Enqueue a command without waiting for it to run.
    ///
    /// On failure the command was never accepted by the actor, and it is
    /// handed back so the caller can retry against a fresh actor.
    pub(crate) async fn deliver(
        &self,
        command: Envelope,
        metadata: CommandMetadata,
    ) -> Result<oneshot::Receiver<ExecuteResult>, (Envelope, CommandMetadata)> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute {
                command,
                metadata,
                reply: tx,
            })
            .await
            .map_err(|mpsc::error::SendError(msg)| match msg {
                ActorMessage::Execute {
                    command, metadata, ..
                } => (command, metadata),
                _ => unreachable!("only Execute messages are sent here"),
            })?;
        Ok(rx)
    }

    /// Read a copy of the current entity state.
    ///
    /// Queued behind any commands already sent, so it observes their
    /// effects.
    ///
    /// # Errors
    ///
    /// * [`StateError::ActorGone`] -- the actor task has exited.
    pub async fn state(&self) -> Result<E::State, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)
    }

    /// Ask the actor to stop after the messages already queued.
    ///
    /// Does nothing if the actor has already exited.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }

    /// Wait until the actor has exited and its final snapshot is saved.
    ///
    /// Returns immediately if that already happened.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // An error means the actor task is gone without raising the flag,
        // which also means it has stopped.
        let _ = stopped.wait_for(|done| *done).await;
    }

    /// Non-blocking form of [`stopped`](EntityHandle::stopped).
    pub(crate) fn has_stopped(&self) -> bool {
        *self.stopped.borrow() || self.stopped.has_changed().is_err()
    }

    /// The id of the entity this handle addresses.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// Returns `false` once the actor has exited (idle timeout or shutdown).
    /// The store uses this to evict stale handles from its cache and
    /// re-spawn the actor on the next `get` call.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn an actor for `entity_id` with explicit collaborators.
///
/// This is the internal entry point used by
/// [`EntityStore`](crate::EntityStore). The actor resumes from the latest
/// snapshot for `entity_id`, or from the empty state if there is none.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn_actor_with_config<E: ValueEntity>(
    entity_id: &str,
    registry: Arc<HandlerRegistry<E>>,
    snapshots: SnapshotMap<E::State>,
    config: ActorConfig,
) -> EntityHandle<E> {
    let snapshot = snapshots.load(entity_id);
    let dispatcher = Dispatcher::with_registry(entity_id.to_owned(), registry, snapshot);
    let (tx, rx) = mpsc::channel::<ActorMessage<E>>(config.mailbox_capacity.max(1));
    let (stopped_tx, stopped_rx) = watch::channel(false);

    tokio::spawn(run_actor::<E>(dispatcher, rx, snapshots, stopped_tx, config));

    EntityHandle {
        entity_id: Arc::from(entity_id),
        sender: tx,
        stopped: stopped_rx,
    }
}

/// Spawn a standalone actor for `entity_id` in its empty state.
///
/// The actor never idles out and keeps its state only for as long as it
/// runs. Use [`EntityStore`](crate::EntityStore) for cached handles,
/// routing by entity type, and idle eviction.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns [`RegistrationError`] if the entity type's handler registry is
/// invalid.
pub fn spawn_actor<E: ValueEntity>(entity_id: &str) -> Result<EntityHandle<E>, RegistrationError> {
    let registry = Arc::new(E::handlers().validate()?);
    Ok(spawn_actor_with_config(
        entity_id,
        registry,
        SnapshotMap::new(),
        ActorConfig::default(),
    ))
}
