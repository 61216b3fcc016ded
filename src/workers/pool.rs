//! Pool coordinator.
//!
//! One actor task owns all scheduling state and reacts to a single event
//! channel, so state changes never overlap and no locks are needed. Callers
//! talk to it through the cloneable [`Pool`] handle.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::error::{ErrorKind, PoolError, Result};
use crate::rembg::{PipelineLoader, ProgressEvent, ProgressSender};
use crate::workers::protocol::{Directive, Event, UnitId, UnitMessage};
use crate::workers::queue::{ActiveTable, PendingQueue};
use crate::workers::task::{ImageRequest, Task, TaskHandle};
use crate::workers::unit::{UnitContext, UnitHandle, spawn_unit};

/// Snapshot of pool occupancy, published after every handled event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_workers: usize,
    pub ready_workers: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub is_initializing: bool,
}

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    events: mpsc::UnboundedSender<Event>,
    stats: watch::Receiver<PoolStats>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Terminate { done: None });
    }
}

impl Pool {
    /// Start the coordinator on the current tokio runtime. Units are not
    /// spawned until [`Pool::initialize`] or the first submission.
    pub fn new(config: PoolConfig, loader: Arc<dyn PipelineLoader>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| PoolError::with_kind(ErrorKind::Config, "no_tokio_runtime").push_std(e))?;

        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| PoolError::with_kind(ErrorKind::Config, "http_client").push_std(e))?;

        let ctx = Arc::new(UnitContext {
            loader,
            client,
            processor_config: config.processor_config.clone(),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(PoolStats::default());
        let coordinator = Coordinator::new(config, ctx, events_tx.clone(), stats_tx);
        runtime.spawn(coordinator.run(events_rx));

        Ok(Self {
            inner: Arc::new(PoolInner {
                events: events_tx,
                stats: stats_rx,
            }),
        })
    }

    /// Spawn the units and start pipeline construction. Later calls are
    /// no-ops; their progress sink is dropped.
    pub fn initialize(&self, progress: Option<ProgressSender>) {
        let _ = self.inner.events.send(Event::Initialize { progress });
    }

    /// Queue a task. Never fails here: every failure, including a pool that
    /// is already gone, surfaces through the returned handle.
    pub fn submit(&self, request: impl Into<ImageRequest>) -> TaskHandle {
        let (task, handle) = Task::new(request.into());
        if let Err(mpsc::error::SendError(Event::Submit(task))) =
            self.inner.events.send(Event::Submit(task))
        {
            task.reject(PoolError::terminated());
        }
        handle
    }

    pub fn stats(&self) -> PoolStats {
        *self.inner.stats.borrow()
    }

    /// Change-notifying view of [`Pool::stats`] for pollers.
    pub fn watch_stats(&self) -> watch::Receiver<PoolStats> {
        self.inner.stats.clone()
    }

    /// Reject everything outstanding and release every unit. Resolves once
    /// the coordinator has stopped.
    pub async fn terminate(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .inner
            .events
            .send(Event::Terminate {
                done: Some(done_tx),
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Initializing,
    Running,
    Terminated,
}

struct UnitSlot {
    handle: UnitHandle,
    busy: bool,
    /// Pipeline construction finished, successfully or not.
    settled: bool,
}

struct Coordinator {
    config: PoolConfig,
    ctx: Arc<UnitContext>,
    events: mpsc::UnboundedSender<Event>,
    stats: watch::Sender<PoolStats>,
    units: BTreeMap<usize, UnitSlot>,
    ready: HashSet<usize>,
    queue: PendingQueue,
    active: ActiveTable,
    init_progress: Option<ProgressSender>,
    lifecycle: Lifecycle,
    next_generation: u64,
}

impl Coordinator {
    fn new(
        config: PoolConfig,
        ctx: Arc<UnitContext>,
        events: mpsc::UnboundedSender<Event>,
        stats: watch::Sender<PoolStats>,
    ) -> Self {
        Self {
            config,
            ctx,
            events,
            stats,
            units: BTreeMap::new(),
            ready: HashSet::new(),
            queue: PendingQueue::default(),
            active: ActiveTable::default(),
            init_progress: None,
            lifecycle: Lifecycle::Idle,
            next_generation: 0,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            let keep_running = self.handle(event);
            self.publish();
            if !keep_running {
                break;
            }
        }
        // Tasks still buffered in the channel are dropped with it and read
        // as terminated on the caller side.
        debug!("coordinator stopped");
    }

    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Initialize { progress } => self.initialize(progress),
            Event::Submit(task) => self.submit(task),
            Event::Unit { unit, message } => self.on_unit_message(unit, message),
            Event::Fault { unit, error } => self.on_unit_fault(unit, error),
            Event::Restart { ordinal } => self.restart(ordinal),
            Event::Terminate { done } => {
                self.terminate();
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return false;
            }
        }
        true
    }

    fn initialize(&mut self, progress: Option<ProgressSender>) {
        if self.lifecycle != Lifecycle::Idle {
            debug!(lifecycle = ?self.lifecycle, "initialize ignored");
            return;
        }

        let count = self.config.unit_count();
        info!(units = count, max_workers = self.config.max_workers, "starting worker pool");

        self.lifecycle = Lifecycle::Initializing;
        self.init_progress = progress;
        for ordinal in 0..count {
            self.spawn(ordinal);
        }
    }

    fn spawn(&mut self, ordinal: usize) {
        let id = UnitId {
            ordinal,
            generation: self.next_generation,
        };
        self.next_generation += 1;

        let handle = spawn_unit(id, self.ctx.clone(), self.events.clone());
        // A unit that is already gone is reported by its supervisor.
        handle.send(Directive::Init);
        self.units.insert(
            ordinal,
            UnitSlot {
                handle,
                busy: false,
                settled: false,
            },
        );
    }

    fn submit(&mut self, task: Task) {
        match self.lifecycle {
            Lifecycle::Terminated => return task.reject(PoolError::terminated()),
            Lifecycle::Idle => self.initialize(None),
            Lifecycle::Initializing | Lifecycle::Running => {}
        }

        debug!(task = %task.id, queued = self.queue.len(), "task queued");
        self.queue.push_back(task);
        self.drain_queue();
    }

    /// Pair the oldest pending task with any ready unit until one side runs out.
    fn drain_queue(&mut self) {
        while !self.queue.is_empty() {
            let Some(ordinal) = self.ready.iter().next().copied() else {
                break;
            };
            self.ready.remove(&ordinal);

            let Some(slot) = self.units.get_mut(&ordinal) else {
                continue;
            };
            let Some(task) = self.queue.pop_front() else {
                self.ready.insert(ordinal);
                break;
            };

            debug_assert!(!self.active.is_bound(ordinal));
            slot.busy = true;
            let unit = slot.handle.id;
            let sent = slot.handle.send(Directive::Run {
                task_id: task.id.clone(),
                request: task.request.clone(),
            });

            debug!(task = %task.id, unit = %unit, waited_ms = task.elapsed_ms(), "task dispatched");
            self.active.bind(ordinal, task);

            if !sent {
                self.on_unit_fault(
                    unit,
                    PoolError::with_kind(ErrorKind::UnitFault, "unit_unreachable"),
                );
            }
        }
    }

    fn is_current(&self, unit: UnitId) -> bool {
        self.units
            .get(&unit.ordinal)
            .is_some_and(|slot| slot.handle.id == unit)
    }

    fn on_unit_message(&mut self, unit: UnitId, message: UnitMessage) {
        if !self.is_current(unit) {
            trace!(unit = %unit, "message from replaced unit dropped");
            return;
        }
        let ordinal = unit.ordinal;

        match message {
            UnitMessage::Ready => {
                info!(unit = %unit, "worker ready");
                let busy = self.units.get(&ordinal).is_some_and(|s| s.busy);
                if !busy {
                    self.ready.insert(ordinal);
                }
                self.mark_settled(ordinal);
                self.drain_queue();
            }
            UnitMessage::Progress(event) => match self.active.get(ordinal) {
                Some(task) => task.report(event),
                None => {
                    if let Some(sink) = &self.init_progress {
                        let _ = sink.send(event);
                    }
                }
            },
            UnitMessage::Complete(cutout) => {
                match self.active.unbind(ordinal) {
                    Some(task) => {
                        info!(task = %task.id, unit = %unit, elapsed_ms = task.elapsed_ms(), "task completed");
                        task.resolve(cutout);
                    }
                    None => warn!(unit = %unit, "completion without a bound task"),
                }
                self.mark_idle(ordinal);
                self.drain_queue();
            }
            UnitMessage::Error(error) => {
                match self.active.unbind(ordinal) {
                    Some(task) => {
                        warn!(task = %task.id, unit = %unit, error = %error.message(), "task failed");
                        task.reject(error);
                    }
                    None => {
                        // Construction failure outside any task. The unit
                        // stays usable: the next task retries construction.
                        error.log_tree();
                        if let Some(sink) = &self.init_progress {
                            let _ = sink.send(ProgressEvent::error(error.message()));
                        }
                        self.mark_settled(ordinal);
                    }
                }
                self.mark_idle(ordinal);
                self.drain_queue();
            }
        }
    }

    fn mark_idle(&mut self, ordinal: usize) {
        if let Some(slot) = self.units.get_mut(&ordinal) {
            slot.busy = false;
            self.ready.insert(ordinal);
        }
    }

    fn mark_settled(&mut self, ordinal: usize) {
        if let Some(slot) = self.units.get_mut(&ordinal) {
            slot.settled = true;
        }
        self.check_initialized();
    }

    fn check_initialized(&mut self) {
        if self.lifecycle == Lifecycle::Initializing && self.units.values().all(|s| s.settled) {
            self.lifecycle = Lifecycle::Running;
            info!(units = self.units.len(), "worker pool initialized");
        }
    }

    fn on_unit_fault(&mut self, unit: UnitId, error: PoolError) {
        if !self.is_current(unit) {
            debug!(unit = %unit, "fault from replaced unit ignored");
            return;
        }
        let ordinal = unit.ordinal;
        error.log_tree();

        if let Some(slot) = self.units.remove(&ordinal) {
            slot.handle.kill();
        }
        self.ready.remove(&ordinal);

        if let Some(task) = self.active.unbind(ordinal) {
            warn!(task = %task.id, unit = %unit, "task lost to worker fault");
            task.reject(PoolError::unit_fault(ordinal).push_any(error));
        }

        let delay = self.config.restart_delay;
        warn!(unit = %unit, delay_ms = delay.as_millis() as u64, "worker faulted, scheduling restart");
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Restart { ordinal });
        });

        self.check_initialized();
    }

    fn restart(&mut self, ordinal: usize) {
        if self.lifecycle == Lifecycle::Terminated || self.units.contains_key(&ordinal) {
            return;
        }
        info!(ordinal, "restarting worker");
        self.spawn(ordinal);
    }

    fn terminate(&mut self) {
        let queued = self.queue.len();
        let active = self.active.len();

        for task in self.queue.drain() {
            task.reject(PoolError::terminated());
        }
        for (_, task) in self.active.drain() {
            task.reject(PoolError::terminated());
        }
        for slot in self.units.values() {
            slot.handle.kill();
        }

        self.units.clear();
        self.ready.clear();
        self.init_progress = None;
        self.lifecycle = Lifecycle::Terminated;
        info!(queued, active, "worker pool terminated");
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            total_workers: self.units.len(),
            ready_workers: self.ready.len(),
            active_tasks: self.active.len(),
            queued_tasks: self.queue.len(),
            is_initializing: self.lifecycle == Lifecycle::Initializing,
        }
    }

    fn publish(&self) {
        self.stats.send_replace(self.snapshot());
    }
}
