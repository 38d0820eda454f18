use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bridgedeck_core::{InstanceId, ReconnectPolicy};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    StatusRefresh,
    PairingConfirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

#[derive(Debug)]
struct TaskHandle {
    generation: u64,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    fn cancel(self) {
        let _ = self.cancel.send(true);
        // The join handle is dropped, not aborted: an in-flight tick finishes
        // and notices through its token that it is no longer active.
        drop(self.join);
    }
}

#[derive(Debug)]
struct PollingSession {
    status_task: Option<TaskHandle>,
    pairing_task: Option<TaskHandle>,
    policy: ReconnectPolicy,
}

impl PollingSession {
    fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            status_task: None,
            pairing_task: None,
            policy: ReconnectPolicy::new(max_reconnect_attempts),
        }
    }

    fn slot(&mut self, kind: TaskKind) -> &mut Option<TaskHandle> {
        match kind {
            TaskKind::StatusRefresh => &mut self.status_task,
            TaskKind::PairingConfirmation => &mut self.pairing_task,
        }
    }

    fn slot_ref(&self, kind: TaskKind) -> Option<&TaskHandle> {
        match kind {
            TaskKind::StatusRefresh => self.status_task.as_ref(),
            TaskKind::PairingConfirmation => self.pairing_task.as_ref(),
        }
    }
}

type Sessions = Arc<Mutex<HashMap<InstanceId, PollingSession>>>;

/// Identity of one running task, handed to every tick.
#[derive(Debug, Clone)]
pub struct TaskToken {
    instance_id: InstanceId,
    kind: TaskKind,
    generation: u64,
    sessions: Sessions,
}

impl TaskToken {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// False once the task was cancelled or replaced.
    pub fn is_active(&self) -> bool {
        lock(&self.sessions)
            .get(&self.instance_id)
            .and_then(|session| session.slot_ref(self.kind))
            .is_some_and(|handle| handle.generation == self.generation)
    }
}

/// Instances with a probe in flight. Kept apart from the task sessions so
/// that cancelling tasks never releases a probe that is still running.
type Probing = Arc<Mutex<HashSet<InstanceId>>>;

/// Marks its instance as probing until the probe that took it ends.
#[derive(Debug)]
pub struct ReconcileGuard {
    instance_id: InstanceId,
    probing: Probing,
}

impl Drop for ReconcileGuard {
    fn drop(&mut self) {
        lock(&self.probing).remove(&self.instance_id);
    }
}

/// Owns every recurring task, keyed by instance. Check-and-store happens
/// under one lock, so a second start of the same kind is a no-op.
#[derive(Debug)]
pub struct PollingScheduler {
    sessions: Sessions,
    probing: Probing,
    generations: AtomicU64,
    max_reconnect_attempts: u32,
}

impl PollingScheduler {
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            probing: Arc::new(Mutex::new(HashSet::new())),
            generations: AtomicU64::new(0),
            max_reconnect_attempts,
        }
    }

    /// Starts a recurring task unless one of the same kind already runs for
    /// this instance. The first tick fires one `interval` after the start.
    pub fn start<F, Fut>(&self, instance_id: &str, kind: TaskKind, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut(TaskToken) -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .entry(instance_id.to_owned())
            .or_insert_with(|| PollingSession::new(self.max_reconnect_attempts));
        let slot = session.slot(kind);
        if slot.as_ref().is_some_and(|handle| !handle.join.is_finished()) {
            debug!(instance_id, ?kind, "task already running");
            return false;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let token = TaskToken {
            instance_id: instance_id.to_owned(),
            kind,
            generation,
            sessions: self.sessions.clone(),
        };
        let (cancel, mut cancelled) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if tick(token.clone()).await == TickControl::Stop {
                            break;
                        }
                    }
                }
            }
            release(&token);
            debug!(instance_id = %token.instance_id, kind = ?token.kind, "task stopped");
        });

        *slot = Some(TaskHandle {
            generation,
            cancel,
            join,
        });
        info!(instance_id, ?kind, ?interval, "task started");
        true
    }

    pub fn is_running(&self, instance_id: &str, kind: TaskKind) -> bool {
        lock(&self.sessions)
            .get(instance_id)
            .and_then(|session| session.slot_ref(kind))
            .is_some_and(|handle| !handle.join.is_finished())
    }

    pub fn running_tasks(&self) -> usize {
        lock(&self.sessions)
            .values()
            .flat_map(|session| [session.status_task.as_ref(), session.pairing_task.as_ref()])
            .flatten()
            .filter(|handle| !handle.join.is_finished())
            .count()
    }

    pub fn cancel(&self, instance_id: &str, kind: TaskKind) {
        let handle = lock(&self.sessions)
            .get_mut(instance_id)
            .and_then(|session| session.slot(kind).take());
        if let Some(handle) = handle {
            handle.cancel();
            info!(instance_id, ?kind, "task cancelled");
        }
    }

    /// Cancels both tasks and forgets the reconnect bookkeeping.
    pub fn cancel_instance(&self, instance_id: &str) {
        let session = lock(&self.sessions).remove(instance_id);
        if let Some(session) = session {
            cancel_session(instance_id, session);
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<(InstanceId, PollingSession)> = lock(&self.sessions).drain().collect();
        for (instance_id, session) in drained {
            cancel_session(&instance_id, session);
        }
    }

    /// `None` while another probe for the same instance is in flight, even
    /// if that probe's task has since been cancelled.
    pub fn begin_reconcile(&self, instance_id: &str) -> Option<ReconcileGuard> {
        if !lock(&self.probing).insert(instance_id.to_owned()) {
            return None;
        }
        Some(ReconcileGuard {
            instance_id: instance_id.to_owned(),
            probing: self.probing.clone(),
        })
    }

    pub fn with_policy<R>(&self, instance_id: &str, apply: impl FnOnce(&mut ReconnectPolicy) -> R) -> R {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .entry(instance_id.to_owned())
            .or_insert_with(|| PollingSession::new(self.max_reconnect_attempts));
        apply(&mut session.policy)
    }
}

fn cancel_session(instance_id: &str, session: PollingSession) {
    for (kind, handle) in [
        (TaskKind::StatusRefresh, session.status_task),
        (TaskKind::PairingConfirmation, session.pairing_task),
    ] {
        if let Some(handle) = handle {
            handle.cancel();
            info!(instance_id, ?kind, "task cancelled");
        }
    }
}

/// A task that stops on its own removes its handle, unless it was already
/// replaced.
fn release(token: &TaskToken) {
    let mut sessions = lock(&token.sessions);
    if let Some(session) = sessions.get_mut(&token.instance_id) {
        let slot = session.slot(token.kind);
        if slot
            .as_ref()
            .is_some_and(|handle| handle.generation == token.generation)
        {
            *slot = None;
        }
    }
}
