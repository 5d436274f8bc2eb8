//! Computation unit: a dedicated OS thread that executes simulation runs.
//!
//! The host owns a [`UnitHandle`]; the worker owns everything else. The two
//! sides share nothing but a pair of unbounded channels.

mod messages;

use std::any::Any;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::core::{
    AggregationPolicy, AssetAssumptions, BlendedNormalModel, ConfigurationError, SimulationConfig,
    SimulationError, SimulationProgress, default_batch_size, fresh_seed, run_batched,
};

pub use messages::{HostMessage, UnitMessage};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UnitOptions {
    /// Trials between checkpoints. `None` checkpoints every 2% of the run.
    pub batch_size: Option<u32>,
    pub policy: AggregationPolicy,
    /// Per-asset override table for the return model.
    pub assumptions: Option<AssetAssumptions>,
}

impl UnitOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size == Some(0) {
            return Err(ConfigurationError::BatchSize);
        }
        if let Some(assumptions) = &self.assumptions {
            assumptions.validate()?;
        }
        Ok(())
    }

    /// Return model for `risk_score`, honouring any assumption overrides.
    pub fn model(&self, risk_score: u32) -> BlendedNormalModel {
        match &self.assumptions {
            Some(assumptions) => BlendedNormalModel::with_assumptions(risk_score, assumptions),
            None => BlendedNormalModel::new(risk_score),
        }
    }

    fn batch_size_for(&self, simulation_count: u32) -> u32 {
        self.batch_size
            .unwrap_or_else(|| default_batch_size(simulation_count))
            .max(1)
    }
}

/// Host-side end of a running unit.
#[derive(Debug)]
pub struct UnitHandle {
    inbox: UnboundedSender<HostMessage>,
    outbox: UnboundedReceiver<UnitMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl UnitHandle {
    pub fn spawn(options: UnitOptions) -> Result<Self, SimulationError> {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            inbox: host_rx,
            outbox: unit_tx,
            options,
            backlog: VecDeque::new(),
        };

        let thread = thread::Builder::new()
            .name("simulation-unit".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                SimulationError::UnresponsiveUnit(format!("failed to spawn computation unit: {e}"))
            })?;

        Ok(Self {
            inbox: host_tx,
            outbox: unit_rx,
            thread: Some(thread),
        })
    }

    pub fn send(&self, message: HostMessage) -> Result<(), SimulationError> {
        self.inbox.send(message).map_err(|_| {
            SimulationError::UnresponsiveUnit("computation unit is no longer receiving".to_string())
        })
    }

    /// Next message from the unit; `None` once the unit has exited.
    pub async fn recv(&mut self) -> Option<UnitMessage> {
        self.outbox.recv().await
    }

    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Closes the command channel. The worker exits at its next checkpoint;
    /// the thread is detached rather than joined so the host never blocks.
    pub fn terminate(mut self) {
        drop(self.thread.take());
    }
}

struct Worker {
    inbox: UnboundedReceiver<HostMessage>,
    outbox: UnboundedSender<UnitMessage>,
    options: UnitOptions,
    /// Requests that arrived mid-run, served once the run ends.
    backlog: VecDeque<HostMessage>,
}

impl Worker {
    fn run(mut self) {
        debug!("computation unit started");
        loop {
            let message = match self.backlog.pop_front() {
                Some(message) => message,
                None => match self.inbox.blocking_recv() {
                    Some(message) => message,
                    None => break,
                },
            };

            let flow = match message {
                HostMessage::Test => self.reply(UnitMessage::Test),
                HostMessage::Simulate { run_id, config } => self.execute(run_id, config),
                HostMessage::Cancel { run_id } => {
                    debug!(run_id, "cancel for inactive run ignored");
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }
        debug!("computation unit stopped");
    }

    fn reply(&self, message: UnitMessage) -> ControlFlow<()> {
        match self.outbox.send(message) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }

    fn execute(&mut self, run_id: u64, config: SimulationConfig) -> ControlFlow<()> {
        let seed = config.seed.unwrap_or_else(fresh_seed);
        let batch_size = self.options.batch_size_for(config.simulation_count);
        let model = self.options.model(config.risk_score);
        info!(
            run_id,
            seed,
            batch_size,
            simulations = config.simulation_count,
            "run started"
        );

        let Worker {
            inbox,
            outbox,
            options,
            backlog,
        } = &mut *self;
        let mut cancelled = false;
        let mut host_gone = false;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_batched(&config, seed, &model, options.policy, batch_size, |progress| {
                checkpoint(
                    run_id,
                    progress,
                    inbox,
                    outbox,
                    backlog,
                    &mut cancelled,
                    &mut host_gone,
                )
            })
        }));

        let reply = match outcome {
            Ok(Ok(Some(result))) => {
                info!(
                    run_id,
                    execution_time_ms = result.execution_time_ms,
                    success_probability = result.success_probability,
                    "run complete"
                );
                UnitMessage::Complete { run_id, result }
            }
            Ok(Ok(None)) if cancelled => {
                info!(run_id, "run cancelled");
                UnitMessage::Cancelled { run_id }
            }
            Ok(Ok(None)) => {
                debug!(run_id, host_gone, "host went away mid-run");
                return ControlFlow::Break(());
            }
            Ok(Err(err)) => {
                warn!(run_id, error = %err, "run failed");
                UnitMessage::Error {
                    run_id,
                    message: err.to_string(),
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(run_id, panic = %message, "run panicked");
                UnitMessage::Error {
                    run_id,
                    message: format!("simulation panicked: {message}"),
                }
            }
        };
        self.reply(reply)
    }
}

/// Batch boundary: publish progress, then drain whatever the host sent.
fn checkpoint(
    run_id: u64,
    progress: SimulationProgress,
    inbox: &mut UnboundedReceiver<HostMessage>,
    outbox: &UnboundedSender<UnitMessage>,
    backlog: &mut VecDeque<HostMessage>,
    cancelled: &mut bool,
    host_gone: &mut bool,
) -> ControlFlow<()> {
    if outbox.send(UnitMessage::Progress { run_id, progress }).is_err() {
        *host_gone = true;
        return ControlFlow::Break(());
    }

    loop {
        match inbox.try_recv() {
            Ok(HostMessage::Cancel { run_id: target }) if target == run_id => {
                *cancelled = true;
                return ControlFlow::Break(());
            }
            Ok(HostMessage::Cancel { run_id: stale }) => {
                debug!(run_id, stale, "cancel for another run ignored");
            }
            Ok(HostMessage::Test) => {
                if outbox.send(UnitMessage::Test).is_err() {
                    *host_gone = true;
                    return ControlFlow::Break(());
                }
            }
            Ok(simulate @ HostMessage::Simulate { .. }) => backlog.push_back(simulate),
            Err(TryRecvError::Empty) => return ControlFlow::Continue(()),
            Err(TryRecvError::Disconnected) => {
                *host_gone = true;
                return ControlFlow::Break(());
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(simulation_count: u32) -> SimulationConfig {
        SimulationConfig {
            initial_wealth: 500_000.0,
            time_horizon_years: 30,
            withdrawal_amount: 25_000.0,
            risk_score: 5,
            inflation_rate: 2.5,
            simulation_count,
            seed: Some(42),
        }
    }

    async fn recv(unit: &mut UnitHandle) -> UnitMessage {
        tokio::time::timeout(Duration::from_secs(60), unit.recv())
            .await
            .expect("unit answered in time")
            .expect("unit still running")
    }

    async fn collect_run(unit: &mut UnitHandle) -> Vec<UnitMessage> {
        let mut messages = Vec::new();
        loop {
            let message = recv(unit).await;
            let terminal = message.is_terminal();
            messages.push(message);
            if terminal {
                return messages;
            }
        }
    }

    #[tokio::test]
    async fn handshake_is_answered_without_a_run() {
        let mut unit = UnitHandle::spawn(UnitOptions::default()).expect("spawn");
        unit.send(HostMessage::Test).expect("send");
        assert_eq!(recv(&mut unit).await, UnitMessage::Test);
        assert!(unit.is_alive());
        unit.terminate();
    }

    #[tokio::test]
    async fn run_streams_progress_then_completes() {
        let options = UnitOptions {
            batch_size: Some(50),
            ..UnitOptions::default()
        };
        let mut unit = UnitHandle::spawn(options).expect("spawn");
        unit.send(HostMessage::Simulate {
            run_id: 1,
            config: config(500),
        })
        .expect("send");

        let messages = collect_run(&mut unit).await;
        let progress: Vec<SimulationProgress> = messages
            .iter()
            .filter_map(|m| match m {
                UnitMessage::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();

        assert_eq!(progress.len(), 10);
        assert!(progress.windows(2).all(|w| w[0].completed <= w[1].completed));
        assert!(progress.last().is_some_and(|p| p.completed == 500));
        match messages.last() {
            Some(UnitMessage::Complete { run_id, result }) => {
                assert_eq!(*run_id, 1);
                assert_eq!(result.simulation_count, 500);
                assert_eq!(result.seed, 42);
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_seed_is_assigned_by_the_unit() {
        let mut unit = UnitHandle::spawn(UnitOptions::default()).expect("spawn");
        let mut unseeded = config(100);
        unseeded.seed = None;
        unit.send(HostMessage::Simulate {
            run_id: 2,
            config: unseeded,
        })
        .expect("send");

        let messages = collect_run(&mut unit).await;
        assert!(matches!(messages.last(), Some(UnitMessage::Complete { .. })));
    }

    #[tokio::test]
    async fn cancel_mid_run_yields_single_cancelled_terminal() {
        let options = UnitOptions {
            batch_size: Some(100),
            ..UnitOptions::default()
        };
        let mut unit = UnitHandle::spawn(options).expect("spawn");
        unit.send(HostMessage::Simulate {
            run_id: 5,
            config: config(100_000),
        })
        .expect("send");

        // Wait for the first checkpoint so the run is known to be in flight.
        let first = recv(&mut unit).await;
        assert!(matches!(first, UnitMessage::Progress { run_id: 5, .. }));
        unit.send(HostMessage::Cancel { run_id: 5 }).expect("send");

        let messages = collect_run(&mut unit).await;
        let terminals = messages.iter().filter(|m| m.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(matches!(
            messages.last(),
            Some(UnitMessage::Cancelled { run_id: 5 })
                | Some(UnitMessage::Complete { run_id: 5, .. })
        ));

        // The unit stays usable after a cancellation.
        unit.send(HostMessage::Test).expect("send");
        assert_eq!(recv(&mut unit).await, UnitMessage::Test);
    }

    #[tokio::test]
    async fn stale_cancel_does_not_stop_the_next_run() {
        let mut unit = UnitHandle::spawn(UnitOptions::default()).expect("spawn");
        unit.send(HostMessage::Cancel { run_id: 1 }).expect("send");
        unit.send(HostMessage::Simulate {
            run_id: 2,
            config: config(200),
        })
        .expect("send");
        let messages = collect_run(&mut unit).await;
        assert!(matches!(
            messages.last(),
            Some(UnitMessage::Complete { run_id: 2, .. })
        ));
    }

    #[tokio::test]
    async fn batch_size_does_not_change_the_result() {
        let mut results = Vec::new();
        for batch_size in [Some(7), Some(100), None] {
            let options = UnitOptions {
                batch_size,
                ..UnitOptions::default()
            };
            let mut unit = UnitHandle::spawn(options).expect("spawn");
            unit.send(HostMessage::Simulate {
                run_id: 1,
                config: config(700),
            })
            .expect("send");
            match collect_run(&mut unit).await.pop() {
                Some(UnitMessage::Complete { mut result, .. }) => {
                    result.execution_time_ms = 0;
                    results.push(result);
                }
                other => panic!("expected complete, got {other:?}"),
            }
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[tokio::test]
    async fn worker_exits_when_host_drops_handle() {
        let unit = UnitHandle::spawn(UnitOptions::default()).expect("spawn");
        let UnitHandle { inbox, thread, .. } = unit;
        drop(inbox);
        let thread = thread.expect("thread handle");
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .expect("join task")
            .expect("worker exited cleanly");
    }

    #[test]
    fn options_validation_rejects_zero_batch() {
        let options = UnitOptions {
            batch_size: Some(0),
            ..UnitOptions::default()
        };
        assert_eq!(options.validate(), Err(ConfigurationError::BatchSize));
        assert_eq!(UnitOptions::default().batch_size_for(5_000), 100);
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("bad state");
        assert_eq!(panic_message(boxed.as_ref()), "bad state");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("worse"));
        assert_eq!(panic_message(boxed.as_ref()), "worse");
    }
}
