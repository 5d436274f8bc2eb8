//! Host-side controller for simulation runs.
//!
//! An [`Orchestrator`] owns at most one computation unit and at most one
//! [`Run`]. All lifecycle state lives here; the unit is reached only through
//! messages. Callers drive the orchestrator from their own task: `start`,
//! `cancel` and `dispose` never block, and unit traffic is consumed through
//! [`Orchestrator::next_event`] (or fed in by hand with
//! [`Orchestrator::handle_message`]).
//!
//! ```text
//! Idle ─start─▶ Initializing ─handshake─▶ Running ─┬─complete─▶ Completed ─▶ Idle
//!                                                  ├─error────▶ Errored   ─▶ Idle
//!                                                  └─cancelled▶ Cancelled ─▶ Idle
//! ```

mod persistence;

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::{
    ConfigurationError, SimulationConfig, SimulationError, SimulationProgress, SimulationResult,
};
use crate::unit::{HostMessage, UnitHandle, UnitMessage, UnitOptions};

pub use persistence::{
    InMemoryPersistence, PersistenceAdapter, PersistenceError, ScenarioMeta, ScenarioRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Initializing,
    Running,
    Completed,
    Cancelled,
    Errored,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("run {0} is still in progress")]
    RunInProgress(u64),
    #[error(transparent)]
    Unit(#[from] SimulationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub run_id: u64,
    pub progress: SimulationProgress,
    pub elapsed_ms: u64,
    /// Linear extrapolation from the completed share; `None` before the
    /// first trial lands.
    pub estimated_remaining_ms: Option<u64>,
}

impl ProgressUpdate {
    fn estimate(run_id: u64, progress: SimulationProgress, elapsed: Duration) -> Self {
        let estimated_remaining_ms = (progress.completed > 0).then(|| {
            let per_trial = elapsed.as_secs_f64() / progress.completed as f64;
            let remaining = progress.total.saturating_sub(progress.completed) as f64 * per_trial;
            (remaining * 1000.0).round() as u64
        });
        Self {
            run_id,
            progress,
            elapsed_ms: elapsed.as_millis() as u64,
            estimated_remaining_ms,
        }
    }
}

/// Callbacks for run lifecycle events. Every method defaults to a no-op.
///
/// For a given run, exactly one of `on_complete`, `on_error` or
/// `on_cancelled` fires. Persistence callbacks follow `on_complete`.
pub trait RunObserver: Send {
    fn on_progress(&mut self, _update: &ProgressUpdate) {}

    fn on_complete(&mut self, _result: &SimulationResult) {}

    fn on_error(&mut self, _error: &SimulationError) {}

    fn on_cancelled(&mut self) {}

    fn on_persisted(&mut self, _record_id: &str) {}

    fn on_persistence_error(&mut self, _error: &PersistenceError) {}
}

impl RunObserver for () {}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Handshake answered while no run was waiting on it.
    Ready,
    Started {
        run_id: u64,
    },
    Progress(ProgressUpdate),
    Completed {
        run_id: u64,
        result: SimulationResult,
        record_id: Option<String>,
    },
    Cancelled {
        run_id: u64,
    },
    Failed {
        run_id: Option<u64>,
        error: SimulationError,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Completed { .. } | RunEvent::Cancelled { .. } | RunEvent::Failed { .. }
        )
    }
}

#[derive(Debug)]
struct Run {
    id: u64,
    config: SimulationConfig,
    meta: Option<ScenarioMeta>,
    state: RunState,
    started_at: Instant,
    cancel_requested: bool,
    last_completed: u32,
}

pub struct Orchestrator<O: RunObserver = ()> {
    options: UnitOptions,
    unit: Option<UnitHandle>,
    unit_ready: bool,
    handshake_pending: bool,
    run: Option<Run>,
    next_run_id: u64,
    last_outcome: Option<RunState>,
    last_execution_ms: Option<u64>,
    observer: O,
    persistence: Option<Box<dyn PersistenceAdapter>>,
}

impl Orchestrator<()> {
    pub fn new(options: UnitOptions) -> Self {
        Self::with_observer(options, ())
    }
}

impl<O: RunObserver> Orchestrator<O> {
    pub fn with_observer(options: UnitOptions, observer: O) -> Self {
        Self {
            options,
            unit: None,
            unit_ready: false,
            handshake_pending: false,
            run: None,
            next_run_id: 1,
            last_outcome: None,
            last_execution_ms: None,
            observer,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, adapter: impl PersistenceAdapter + 'static) -> Self {
        self.persistence = Some(Box::new(adapter));
        self
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn state(&self) -> RunState {
        self.run.as_ref().map_or(RunState::Idle, |run| run.state)
    }

    pub fn active_run_id(&self) -> Option<u64> {
        self.run.as_ref().map(|run| run.id)
    }

    /// Terminal state of the most recent run.
    pub fn last_outcome(&self) -> Option<RunState> {
        self.last_outcome
    }

    pub fn last_execution_ms(&self) -> Option<u64> {
        self.last_execution_ms
    }

    pub fn has_unit(&self) -> bool {
        self.unit.is_some()
    }

    /// Sends a readiness probe, spawning a unit if none is alive. The answer
    /// arrives as [`RunEvent::Ready`].
    pub fn ping(&mut self) -> Result<(), StartError> {
        self.ensure_unit()?;
        self.send(HostMessage::Test)?;
        self.handshake_pending = true;
        Ok(())
    }

    pub fn start(&mut self, config: SimulationConfig) -> Result<u64, StartError> {
        self.start_scenario(config, None)
    }

    /// Submits a run. Rejected while another run is initializing or running.
    /// With `meta` set and a persistence adapter installed, the result is
    /// stored once the run completes.
    pub fn start_scenario(
        &mut self,
        config: SimulationConfig,
        meta: Option<ScenarioMeta>,
    ) -> Result<u64, StartError> {
        if let Some(run) = &self.run {
            return Err(StartError::RunInProgress(run.id));
        }
        config.validate()?;
        self.options.validate()?;
        self.ensure_unit()?;

        let run_id = self.next_run_id;
        self.next_run_id += 1;
        self.run = Some(Run {
            id: run_id,
            config,
            meta,
            state: RunState::Initializing,
            started_at: Instant::now(),
            cancel_requested: false,
            last_completed: 0,
        });
        info!(run_id, "run submitted");

        let sent = if self.unit_ready {
            self.dispatch().map(|_| ())
        } else {
            self.handshake_pending = true;
            self.send(HostMessage::Test)
        };
        if let Err(err) = sent {
            self.drop_unit();
            self.run = None;
            return Err(err.into());
        }
        Ok(run_id)
    }

    /// Requests cooperative cancellation. Returns false when nothing is
    /// in flight. The run ends with `Cancelled`, or with `Completed` when the
    /// unit finished before it saw the request.
    pub fn cancel(&mut self) -> bool {
        let Some(run) = self.run.as_mut() else {
            return false;
        };
        if run.cancel_requested {
            return true;
        }
        run.cancel_requested = true;
        let run_id = run.id;
        info!(run_id, "cancel requested");

        if run.state == RunState::Running {
            if let Err(err) = self.send(HostMessage::Cancel { run_id }) {
                self.on_unit_lost(err);
            }
        }
        true
    }

    /// Tears down the unit and forgets any run. Safe at any time; an active
    /// run is reported as cancelled.
    pub fn dispose(&mut self) {
        if let (Some(run), Some(unit)) = (&self.run, &self.unit) {
            if run.state == RunState::Running {
                if let Err(err) = unit.send(HostMessage::Cancel { run_id: run.id }) {
                    debug!(run_id = run.id, error = %err, "cancel not delivered during dispose");
                }
            }
        }
        self.drop_unit();
        if let Some(run) = self.finish(RunState::Cancelled) {
            debug!(run_id = run.id, "run dropped by dispose");
            self.observer.on_cancelled();
        }
    }

    /// Host-side verdict that the unit stopped answering. Disposes it and
    /// fails the active run with `UnresponsiveUnit`.
    pub fn fail_unresponsive(&mut self, reason: impl Into<String>) -> RunEvent {
        self.on_unit_lost(SimulationError::UnresponsiveUnit(reason.into()))
    }

    /// Applies one unit message to the state machine. Messages for runs other
    /// than the active one are dropped.
    pub fn handle_message(&mut self, message: UnitMessage) -> Option<RunEvent> {
        let active = self.active_run_id();
        if message.run_id().is_some() && message.run_id() != active {
            debug!(?message, "message for inactive run ignored");
            return None;
        }

        match message {
            UnitMessage::Test => self.on_handshake(),
            UnitMessage::Progress { progress, .. } => self.on_progress(progress),
            UnitMessage::Complete { result, .. } => self.on_complete(result),
            UnitMessage::Error { message, .. } => self.on_error(SimulationError::Runtime(message)),
            UnitMessage::Cancelled { .. } => self.on_cancelled(),
        }
    }

    /// Waits for the next event. `None` when nothing is in flight.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        loop {
            if self.run.is_none() && !self.handshake_pending {
                return None;
            }
            let unit = self.unit.as_mut()?;
            match unit.recv().await {
                Some(message) => {
                    if let Some(event) = self.handle_message(message) {
                        return Some(event);
                    }
                }
                None => {
                    return Some(self.fail_unresponsive("computation unit exited unexpectedly"));
                }
            }
        }
    }

    /// Like [`next_event`](Self::next_event), but treats `timeout` without any
    /// unit message as an unresponsive unit.
    pub async fn next_event_within(&mut self, timeout: Duration) -> Option<RunEvent> {
        let outcome = tokio::time::timeout(timeout, self.next_event()).await;
        match outcome {
            Ok(event) => event,
            Err(_) => Some(self.fail_unresponsive(format!(
                "no message from computation unit within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Drains events until the active run reaches a terminal state.
    pub async fn wait_for_terminal(&mut self, idle_timeout: Option<Duration>) -> Option<RunEvent> {
        loop {
            let event = match idle_timeout {
                Some(timeout) => self.next_event_within(timeout).await?,
                None => self.next_event().await?,
            };
            if event.is_terminal() {
                return Some(event);
            }
        }
    }

    fn ensure_unit(&mut self) -> Result<(), SimulationError> {
        if self.unit.is_some() {
            return Ok(());
        }
        self.unit = Some(UnitHandle::spawn(self.options)?);
        self.unit_ready = false;
        debug!("computation unit spawned");
        Ok(())
    }

    fn drop_unit(&mut self) {
        if let Some(unit) = self.unit.take() {
            unit.terminate();
            debug!("computation unit terminated");
        }
        self.unit_ready = false;
        self.handshake_pending = false;
    }

    fn send(&self, message: HostMessage) -> Result<(), SimulationError> {
        match &self.unit {
            Some(unit) => unit.send(message),
            None => Err(SimulationError::UnresponsiveUnit(
                "no computation unit".to_string(),
            )),
        }
    }

    fn dispatch(&mut self) -> Result<u64, SimulationError> {
        let Some(run) = self.run.as_mut() else {
            return Err(SimulationError::runtime("no run to dispatch"));
        };
        run.state = RunState::Running;
        run.started_at = Instant::now();
        let message = HostMessage::Simulate {
            run_id: run.id,
            config: run.config.clone(),
        };
        let run_id = run.id;
        self.send(message)?;
        debug!(run_id, "run dispatched");
        Ok(run_id)
    }

    /// Ends the active run with `outcome`, leaving the orchestrator idle.
    fn finish(&mut self, outcome: RunState) -> Option<Run> {
        let mut run = self.run.take()?;
        run.state = outcome;
        self.last_outcome = Some(outcome);
        debug!(run_id = run.id, state = ?outcome, "run finished");
        Some(run)
    }

    fn on_handshake(&mut self) -> Option<RunEvent> {
        self.unit_ready = true;
        self.handshake_pending = false;

        let (state, cancel_requested) = match &self.run {
            Some(run) => (run.state, run.cancel_requested),
            None => return Some(RunEvent::Ready),
        };
        if state != RunState::Initializing {
            return None;
        }
        if cancel_requested {
            return self.on_cancelled();
        }
        match self.dispatch() {
            Ok(run_id) => Some(RunEvent::Started { run_id }),
            Err(err) => Some(self.on_unit_lost(err)),
        }
    }

    fn on_progress(&mut self, progress: SimulationProgress) -> Option<RunEvent> {
        let run = self.run.as_mut()?;
        if run.state != RunState::Running || progress.completed < run.last_completed {
            return None;
        }
        run.last_completed = progress.completed;
        let update = ProgressUpdate::estimate(run.id, progress, run.started_at.elapsed());
        self.observer.on_progress(&update);
        Some(RunEvent::Progress(update))
    }

    fn on_complete(&mut self, result: SimulationResult) -> Option<RunEvent> {
        let run = self.finish(RunState::Completed)?;
        self.last_execution_ms = Some(result.execution_time_ms);
        info!(
            run_id = run.id,
            execution_time_ms = result.execution_time_ms,
            success_probability = result.success_probability,
            "run completed"
        );
        self.observer.on_complete(&result);
        let record_id = self.persist(&run, &result);
        Some(RunEvent::Completed {
            run_id: run.id,
            result,
            record_id,
        })
    }

    fn on_error(&mut self, error: SimulationError) -> Option<RunEvent> {
        let run = self.finish(RunState::Errored)?;
        warn!(run_id = run.id, error = %error, "run failed");
        self.observer.on_error(&error);
        Some(RunEvent::Failed {
            run_id: Some(run.id),
            error,
        })
    }

    fn on_cancelled(&mut self) -> Option<RunEvent> {
        let run = self.finish(RunState::Cancelled)?;
        info!(run_id = run.id, "run cancelled");
        self.observer.on_cancelled();
        Some(RunEvent::Cancelled { run_id: run.id })
    }

    fn on_unit_lost(&mut self, error: SimulationError) -> RunEvent {
        warn!(error = %error, "computation unit lost");
        self.drop_unit();
        let run_id = self.finish(RunState::Errored).map(|run| run.id);
        if run_id.is_some() {
            self.observer.on_error(&error);
        }
        RunEvent::Failed { run_id, error }
    }

    fn persist(&mut self, run: &Run, result: &SimulationResult) -> Option<String> {
        let meta = run.meta.clone()?;
        let adapter = self.persistence.as_mut()?;
        let record = ScenarioRecord::new(run.config.clone(), result.clone(), meta);
        match adapter.save(&record) {
            Ok(record_id) => {
                info!(run_id = run.id, %record_id, "scenario persisted");
                self.observer.on_persisted(&record_id);
                Some(record_id)
            }
            Err(err) => {
                warn!(run_id = run.id, error = %err, "scenario persistence failed");
                self.observer.on_persistence_error(&err);
                None
            }
        }
    }
}

impl<O: RunObserver> Drop for Orchestrator<O> {
    fn drop(&mut self) {
        self.dispose();
    }
}
