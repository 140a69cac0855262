//! The process-wide machine registry.
//!
//! The manager owns every [`TaskStateMachine`], performs the room I/O the
//! machines themselves stay free of, routes incoming socket events to the
//! right machine, and re-emits state snapshots for cross-cutting consumers.
//! Machines are created lazily on first reference and live until their owner
//! explicitly leaves the task; nothing is auto-evicted.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use wegent_gateway::gateway::{GatewayError, SocketGateway};
use wegent_gateway::protocol::{ChatEvent, JoinOptions, JoinReply};

use crate::machine::{RecoverAction, RecoverOptions, TaskSnapshot, TaskStateMachine};

const STATE_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Room seam
// ---------------------------------------------------------------------------

/// The slice of the socket gateway a machine's recovery needs. Injected so
/// the state layer can be driven without a live socket.
#[async_trait]
pub trait RoomClient: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn join_task(
        &self,
        task_id: i64,
        options: JoinOptions,
    ) -> Result<JoinReply, GatewayError>;

    async fn leave_task(&self, task_id: i64) -> Result<(), GatewayError>;
}

#[async_trait]
impl RoomClient for SocketGateway {
    fn is_connected(&self) -> bool {
        SocketGateway::is_connected(self)
    }

    async fn join_task(
        &self,
        task_id: i64,
        options: JoinOptions,
    ) -> Result<JoinReply, GatewayError> {
        SocketGateway::join_task(self, task_id, options).await
    }

    async fn leave_task(&self, task_id: i64) -> Result<(), GatewayError> {
        SocketGateway::leave_task(self, task_id).await
    }
}

// ---------------------------------------------------------------------------
// TaskStateManager
// ---------------------------------------------------------------------------

struct Inner {
    rooms: Arc<dyn RoomClient>,
    machines: Mutex<HashMap<i64, Arc<Mutex<TaskStateMachine>>>>,
    state_events: broadcast::Sender<TaskSnapshot>,
}

/// Process-wide registry of task state machines.
#[derive(Clone)]
pub struct TaskStateManager {
    inner: Arc<Inner>,
}

impl TaskStateManager {
    pub fn new(rooms: Arc<dyn RoomClient>) -> Self {
        let (state_events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                rooms,
                machines: Mutex::new(HashMap::new()),
                state_events,
            }),
        }
    }

    /// The machine for a task, created lazily on first reference.
    pub fn get_or_create(&self, task_id: i64) -> Arc<Mutex<TaskStateMachine>> {
        self.inner
            .machines
            .lock()
            .entry(task_id)
            .or_insert_with(|| {
                debug!("Creating state machine for task {task_id}");
                Arc::new(Mutex::new(TaskStateMachine::new(task_id)))
            })
            .clone()
    }

    /// The machine for a task, if one exists.
    pub fn machine(&self, task_id: i64) -> Option<Arc<Mutex<TaskStateMachine>>> {
        self.inner.machines.lock().get(&task_id).cloned()
    }

    /// Ids of all live tasks.
    pub fn task_ids(&self) -> Vec<i64> {
        self.inner.machines.lock().keys().copied().collect()
    }

    /// Global `(task, state)` stream for cross-cutting consumers.
    pub fn state_events(&self) -> broadcast::Receiver<TaskSnapshot> {
        self.inner.state_events.subscribe()
    }

    // -- Recovery ------------------------------------------------------------

    /// Recover one task: join its room, merge the snapshot, and keep going
    /// while recoveries queued up behind the in-flight one.
    pub async fn recover(&self, task_id: i64, options: RecoverOptions) {
        let machine = self.get_or_create(task_id);

        let mut action = machine.lock().begin_recover(options);
        loop {
            let join_options = match action {
                RecoverAction::Join(join_options) => join_options,
                // Debounced, or another recovery owns the in-flight join.
                _ => return,
            };

            let result = self.inner.rooms.join_task(task_id, join_options).await;

            let queued = {
                let mut machine = machine.lock();
                match result {
                    Ok(reply) => machine.apply_join_success(reply),
                    Err(e) => machine.apply_join_failure(e.to_string()),
                }
            };
            self.emit(&machine);

            match queued {
                Some(options) => action = machine.lock().begin_recover(options),
                None => return,
            }
        }
    }

    /// Recover every live task concurrently; used after a reconnect.
    pub async fn recover_all(&self, force: bool) {
        let task_ids = self.task_ids();
        if task_ids.is_empty() {
            return;
        }
        info!("Recovering {} task(s)", task_ids.len());
        let options = RecoverOptions { force };
        futures::future::join_all(
            task_ids
                .into_iter()
                .map(|task_id| self.recover(task_id, options)),
        )
        .await;
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Leave the task's room and drop its machine.
    pub async fn cleanup(&self, task_id: i64) {
        let machine = self.inner.machines.lock().remove(&task_id);
        if let Some(machine) = machine {
            machine.lock().leave();
        }
        if let Err(e) = self.inner.rooms.leave_task(task_id).await {
            warn!("Failed to leave room for task {task_id}: {e}");
        }
    }

    /// Leave every room and drop every machine.
    pub async fn cleanup_all(&self) {
        for task_id in self.task_ids() {
            self.cleanup(task_id).await;
        }
    }

    /// Move a machine keyed under a client-temporary id to its real id once
    /// the first streaming frame resolves it.
    pub fn migrate_task(&self, from: i64, to: i64) {
        if from == to {
            return;
        }
        let mut machines = self.inner.machines.lock();
        let Some(machine) = machines.remove(&from) else {
            return;
        };
        machine.lock().set_task_id(to);
        machines.insert(to, machine);
        debug!("Migrated task state {from} -> {to}");
    }

    // -- Event routing -------------------------------------------------------

    /// The task that owns a subtask, found by linear scan. Used to route
    /// events the server did not tag with a task id.
    pub fn find_task_by_subtask_id(&self, subtask_id: i64) -> Option<i64> {
        let machines = self.inner.machines.lock();
        for (task_id, machine) in machines.iter() {
            let machine = machine.lock();
            let owns = machine
                .ordered_messages()
                .iter()
                .any(|m| m.header().subtask_id == Some(subtask_id))
                || machine.streaming_subtask_id() == Some(subtask_id);
            if owns {
                return Some(*task_id);
            }
        }
        None
    }

    /// Feed one incoming socket event to the machine that owns it.
    pub fn route_event(&self, task_id: Option<i64>, event: ChatEvent) {
        let task_id = match task_id {
            Some(task_id) => task_id,
            None => match self.find_task_by_subtask_id(event.subtask_id()) {
                Some(task_id) => task_id,
                None => {
                    warn!(
                        "No task owns subtask {}; dropping event",
                        event.subtask_id()
                    );
                    return;
                }
            },
        };

        self.update(task_id, |machine| machine.handle_event(event));
    }

    /// Run a mutation against a task's machine and broadcast the resulting
    /// snapshot to state observers. This is how the send-message flow applies
    /// optimistic inserts, confirmations, and edit cascades.
    pub fn update<R>(&self, task_id: i64, f: impl FnOnce(&mut TaskStateMachine) -> R) -> R {
        let machine = self.get_or_create(task_id);
        let result = f(&mut machine.lock());
        self.emit(&machine);
        result
    }

    /// Wire the manager to a live gateway: route its events and batch-recover
    /// with `force=true` after every reconnect.
    pub fn attach(&self, gateway: &SocketGateway) {
        let mut events = gateway.events();
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(routed) => router.route_event(routed.task_id, routed.event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event router lagged; {missed} event(s) lost, recovering all");
                        router.recover_all(true).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut reconnects = gateway.on_reconnect();
        let recoverer = self.clone();
        tokio::spawn(async move {
            while reconnects.recv().await.is_ok() {
                info!("Socket reconnected; recovering all tasks");
                recoverer.recover_all(true).await;
            }
        });
    }

    fn emit(&self, machine: &Arc<Mutex<TaskStateMachine>>) {
        let _ = self.inner.state_events.send(machine.lock().snapshot());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
