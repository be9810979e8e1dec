//! Viewport-driven load scheduling.
//!
//! The scheduler is an actor on the caller's runtime. Viewport changes are
//! debounced; when the timer fires a new generation is dispatched, and only
//! results tagged with the accepted generation ever reach the sink.
//!
//! States: `Idle -> Debouncing -> Loading -> {Applied | Cancelled | Failed}`.
//! `Applied` and `Failed` fall back to `Idle` once reported; any viewport
//! change moves to `Debouncing` whatever the current state. A debounced view
//! equal to the last applied one goes straight back to `Idle` without a new
//! generation.

use std::sync::Arc;

use formats::OutputShape;
use foundation::QueryBounds;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use runtime::{CancelFlag, DispatchError, Debounce, PendingQueue};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::archive::BoxFuture;
use crate::error::LoadError;
use crate::events::LoadSink;
use crate::pipeline::{PartialResult, Pipeline, WorkerOutcome};
use crate::request::{Generation, LoadRequest, LoadTarget};
use crate::viewport::{Viewport, visible_bounds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SchedulerState {
    Idle,
    Debouncing,
    Loading,
    Applied,
    Cancelled,
    Failed,
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Latest generation allocated (not necessarily applied).
    pub generation: Generation,
    /// How the last finished or superseded load ended.
    pub last_outcome: Option<SchedulerState>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            generation: Generation::default(),
            last_outcome: None,
        }
    }
}

enum Command {
    ViewportChanged(Arc<dyn Viewport>),
    Shutdown,
}

/// Owner side of a running scheduler. Dropping it stops the actor.
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SchedulerStatus>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Returns `false` if the scheduler is no longer running.
    pub fn viewport_changed(&self, viewport: Arc<dyn Viewport>) -> bool {
        self.commands.send(Command::ViewportChanged(viewport)).is_ok()
    }

    pub fn state(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.status.borrow()
    }

    /// Cancels the in-flight generation and waits for the actor to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Scheduler task ended abnormally: {e}");
        }
    }
}

struct Completion {
    generation: Generation,
    target: LoadTarget,
    result: Result<WorkerOutcome, DispatchError>,
}

/// What a load depends on in a viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ViewKey {
    bounds: QueryBounds,
    zoom: f64,
    size: [f64; 2],
    globe: bool,
}

impl ViewKey {
    fn of(viewport: &dyn Viewport) -> Self {
        Self {
            bounds: visible_bounds(viewport),
            zoom: viewport.zoom(),
            size: [viewport.width(), viewport.height()],
            globe: viewport.is_globe(),
        }
    }
}

/// Bookkeeping for the generation currently accepted.
struct ActiveLoad {
    generation: Generation,
    view: ViewKey,
    cancel: CancelFlag,
    output: OutputShape,
    pending: PendingQueue<LoadTarget>,
    inflight: usize,
    failed: bool,
}

pub struct ViewportLoadScheduler {
    pipeline: Pipeline,
    sink: Arc<dyn LoadSink>,
    debounce: Debounce,
    viewport: Option<Arc<dyn Viewport>>,
    /// View of the last generation that finished `Applied`.
    applied: Option<ViewKey>,
    generation: Generation,
    active: Option<ActiveLoad>,
    inflight: FuturesUnordered<BoxFuture<'static, Completion>>,
    partial_tx: mpsc::UnboundedSender<PartialResult>,
    partial_rx: mpsc::UnboundedReceiver<PartialResult>,
    status: watch::Sender<SchedulerStatus>,
}

impl ViewportLoadScheduler {
    /// Starts the actor on the current tokio runtime.
    pub fn spawn(pipeline: Pipeline, sink: Arc<dyn LoadSink>) -> SchedulerHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SchedulerStatus::default());
        let (partial_tx, partial_rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            debounce: Debounce::new(pipeline.config().debounce()),
            pipeline,
            sink,
            viewport: None,
            applied: None,
            generation: Generation::default(),
            active: None,
            inflight: FuturesUnordered::new(),
            partial_tx,
            partial_rx,
            status,
        };
        let task = tokio::spawn(scheduler.run(command_rx));

        SchedulerHandle {
            commands,
            status: status_rx,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::ViewportChanged(viewport)) => self.on_viewport_changed(viewport),
                    Some(Command::Shutdown) | None => break,
                },
                // Partials of a job are queued before its completion, so
                // draining them first keeps batch order intact.
                Some(partial) = self.partial_rx.recv() => self.on_partial(partial),
                Some(done) = self.inflight.next(), if !self.inflight.is_empty() => self.on_completion(done),
                _ = self.debounce.fired() => self.on_debounce_fired(),
            }
        }

        if self.supersede() {
            self.publish(SchedulerState::Cancelled, Some(SchedulerState::Cancelled));
        }
        debug!("Viewport scheduler stopped at {}", self.generation);
    }

    fn publish(&self, state: SchedulerState, outcome: Option<SchedulerState>) {
        let generation = self.generation;
        self.status.send_modify(|s| {
            s.state = state;
            s.generation = generation;
            if outcome.is_some() {
                s.last_outcome = outcome;
            }
        });
    }

    /// Stops accepting the active generation and flags its jobs. Returns
    /// whether a load was active.
    fn supersede(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        active.cancel.cancel();
        debug!(
            "Superseded {} with {} tiles in flight",
            active.generation, active.inflight
        );
        true
    }

    fn on_viewport_changed(&mut self, viewport: Arc<dyn Viewport>) {
        if self.supersede() {
            self.publish(SchedulerState::Cancelled, Some(SchedulerState::Cancelled));
        }
        self.viewport = Some(viewport);
        self.debounce.arm();
        self.publish(SchedulerState::Debouncing, None);
    }

    fn on_debounce_fired(&mut self) {
        let Some(viewport) = self.viewport.clone() else {
            return;
        };
        let view = ViewKey::of(viewport.as_ref());
        if self.applied == Some(view) {
            debug!("Viewport unchanged since {}, nothing to load", self.generation);
            self.publish(SchedulerState::Idle, None);
            return;
        }
        self.generation = self.generation.next();
        let generation = self.generation;
        let output = self.pipeline.config().output_for(viewport.as_ref());

        let mut pending = PendingQueue::new();
        for (priority, target) in self.pipeline.targets_for(viewport.as_ref()) {
            pending.push(priority, target);
        }
        info!("Loading {generation}: {} targets, {:?} output", pending.len(), output);

        self.active = Some(ActiveLoad {
            generation,
            view,
            cancel: CancelFlag::new(),
            output,
            pending,
            inflight: 0,
            failed: false,
        });
        self.publish(SchedulerState::Loading, None);
        self.pump();
        self.finish_if_done();
    }

    /// Dispatches queued targets until the in-flight limit is reached.
    fn pump(&mut self) {
        let limit = self.pipeline.config().max_inflight_tiles.max(1);
        let Some(active) = self.active.as_mut() else {
            return;
        };
        while active.inflight < limit {
            let Some(target) = active.pending.pop_next() else {
                break;
            };
            let generation = active.generation;
            let request = LoadRequest::new(target, generation, active.cancel.clone());
            let job = self
                .pipeline
                .dispatch(request, active.output, self.partial_tx.clone());
            active.inflight += 1;
            self.inflight.push(Box::pin(async move {
                Completion {
                    generation,
                    target,
                    result: job.await,
                }
            }));
        }
    }

    fn accepts(&self, generation: Generation) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    fn on_partial(&mut self, partial: PartialResult) {
        if !self.accepts(partial.generation) {
            trace!("Discarding stale partial from {}", partial.generation);
            return;
        }
        self.sink
            .on_partial(partial.generation, partial.target, partial.payload);
    }

    fn on_completion(&mut self, done: Completion) {
        if !self.accepts(done.generation) {
            debug!("Discarding stale result from {} ({})", done.generation, done.target);
            return;
        }

        let outcome = match done.result {
            Ok(outcome) => outcome,
            Err(e) => WorkerOutcome::Failed(LoadError::from(e)),
        };
        let mut failed = false;
        match outcome {
            WorkerOutcome::Loaded(payload) => {
                trace!("{} loaded {}: {} features", done.generation, done.target, payload.feature_count());
                self.sink.on_load(done.generation, done.target, payload);
            }
            WorkerOutcome::Cancelled => {}
            WorkerOutcome::Failed(e) if e.is_cancellation() => {}
            WorkerOutcome::Failed(e) => {
                warn!("Load of {} failed in {}: {e}", done.target, done.generation);
                failed = true;
                self.sink
                    .on_error(done.generation, e.kind(), format!("{}: {e}", done.target));
            }
        }

        if let Some(active) = self.active.as_mut() {
            active.inflight -= 1;
            active.failed |= failed;
        }
        self.pump();
        self.finish_if_done();
    }

    fn finish_if_done(&mut self) {
        let done = self
            .active
            .as_ref()
            .is_some_and(|a| a.inflight == 0 && a.pending.is_empty());
        if !done {
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };
        let outcome = if active.failed {
            self.applied = None;
            SchedulerState::Failed
        } else {
            self.applied = Some(active.view);
            SchedulerState::Applied
        };
        info!("{} finished: {:?}", active.generation, outcome);
        self.publish(outcome, Some(outcome));
        self.publish(SchedulerState::Idle, None);
    }
}
