mod aggregate;
mod engine;
mod error;
mod returns;
mod solver;
mod types;

pub use aggregate::{
    AggregationPolicy, Aggregator, DrawdownPolicy, RunningStats, VolatilityPolicy,
    percentile_sorted,
};
pub use engine::{default_batch_size, run_batched, run_simulation, simulate_trial};
pub use error::{ConfigurationError, SimulationError};
pub use returns::{
    Allocation, AssetAssumption, AssetAssumptions, BlendedNormalModel, ReturnModel, Rng,
    derive_run_seed, derive_seed, fresh_seed, sample_year,
};
pub use solver::{
    SolveError, WithdrawalSolveConfig, WithdrawalSolveIteration, WithdrawalSolveResult,
    solve_max_withdrawal,
};
pub use types::{
    ConfidenceIntervals, MAX_HORIZON_YEARS, MAX_RISK_SCORE, MAX_SIMULATIONS, MIN_HORIZON_YEARS,
    MIN_RISK_SCORE, MIN_SIMULATIONS, SimulationConfig, SimulationProgress, SimulationResult,
    TrialOutcome,
};
