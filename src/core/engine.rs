use std::ops::ControlFlow;
use std::time::Instant;

use super::aggregate::{AggregationPolicy, Aggregator, RunningStats};
use super::error::SimulationError;
use super::returns::{ReturnModel, sample_year};
use super::types::{SimulationConfig, SimulationProgress, SimulationResult, TrialOutcome};

/// Progress cadence used when no batch size is given: one checkpoint per 2%.
pub const DEFAULT_CHECKPOINTS: u32 = 50;

pub fn default_batch_size(simulation_count: u32) -> u32 {
    simulation_count.div_ceil(DEFAULT_CHECKPOINTS).max(1)
}

/// Simulates one lifetime. Pure in (config, model, seed, trial).
///
/// Returns are sampled for every year of the horizon, including years after
/// depletion, so the pooled return sample does not depend on outcomes.
pub fn simulate_trial<M: ReturnModel + ?Sized>(
    config: &SimulationConfig,
    model: &M,
    seed: u64,
    trial: u32,
) -> Result<TrialOutcome, SimulationError> {
    let mut wealth = config.initial_wealth;
    let mut peak = wealth;
    let mut max_drawdown_percent: f64 = 0.0;
    let mut depletion_year = None;
    let mut shortfall = 0.0;
    let mut returns = RunningStats::default();

    for year in 1..=config.time_horizon_years {
        let r = sample_year(model, seed, trial, year);
        if !r.is_finite() {
            return Err(SimulationError::runtime(format!(
                "non-finite return sampled in trial {trial}, year {year}"
            )));
        }
        returns.push(r);

        if depletion_year.is_some() {
            continue;
        }

        let available = wealth * (1.0 + r);
        let required = config.required_withdrawal(year);
        let next = available - required;
        if !next.is_finite() {
            return Err(SimulationError::runtime(format!(
                "wealth overflowed in trial {trial}, year {year}"
            )));
        }

        if next <= 0.0 {
            wealth = 0.0;
            depletion_year = Some(year);
            shortfall = (required - available).max(0.0);
        } else {
            wealth = next;
        }

        peak = peak.max(wealth);
        if peak > 0.0 {
            max_drawdown_percent = max_drawdown_percent.max((peak - wealth) / peak * 100.0);
        }
    }

    Ok(TrialOutcome {
        final_wealth: wealth,
        success: wealth > 0.0,
        depletion_year,
        max_drawdown_percent,
        shortfall,
        returns,
    })
}

/// Runs every trial of `config` in batches of `batch_size`, handing a
/// progress snapshot to `checkpoint` after each batch.
///
/// `checkpoint` returning `Break` abandons the run and yields `Ok(None)`;
/// the partial aggregate is dropped. Trials are folded in index order, so
/// the result does not depend on `batch_size`.
pub fn run_batched<M, F>(
    config: &SimulationConfig,
    seed: u64,
    model: &M,
    policy: AggregationPolicy,
    batch_size: u32,
    mut checkpoint: F,
) -> Result<Option<SimulationResult>, SimulationError>
where
    M: ReturnModel + ?Sized,
    F: FnMut(SimulationProgress) -> ControlFlow<()>,
{
    let started = Instant::now();
    let total = config.simulation_count;
    let batch_size = batch_size.max(1);
    let mut aggregator = Aggregator::new(total, policy);

    let mut completed = 0;
    while completed < total {
        let end = completed.saturating_add(batch_size).min(total);
        for trial in completed..end {
            let outcome = simulate_trial(config, model, seed, trial)?;
            aggregator.push(&outcome);
        }
        completed = end;

        if checkpoint(SimulationProgress::new(completed, total)).is_break() {
            return Ok(None);
        }
    }

    let mut result = aggregator.finish()?;
    result.seed = seed;
    result.execution_time_ms = started.elapsed().as_millis() as u64;
    Ok(Some(result))
}

/// Synchronous run with no progress reporting.
pub fn run_simulation<M: ReturnModel + ?Sized>(
    config: &SimulationConfig,
    seed: u64,
    model: &M,
    policy: AggregationPolicy,
) -> Result<SimulationResult, SimulationError> {
    run_batched(
        config,
        seed,
        model,
        policy,
        config.simulation_count,
        |_| ControlFlow::Continue(()),
    )?
    .ok_or_else(|| SimulationError::runtime("run stopped without a result"))
}
