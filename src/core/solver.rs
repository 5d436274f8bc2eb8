use serde::Serialize;

use super::aggregate::AggregationPolicy;
use super::engine::run_simulation;
use super::error::{ConfigurationError, SimulationError};
use super::returns::{ReturnModel, fresh_seed};
use super::types::{MAX_SIMULATIONS, MIN_SIMULATIONS, SimulationConfig};

#[derive(Debug, Clone, Copy)]
pub struct WithdrawalSolveConfig {
    /// Required success probability in percent.
    pub target_success_probability: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub simulations_per_iteration: u32,
    pub final_simulations: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_withdrawal: f64,
    pub success_probability: f64,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalSolveResult {
    pub target_success_probability: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub seed: u64,
    pub solved_withdrawal: Option<f64>,
    pub solved_withdrawal_rate: Option<f64>,
    pub achieved_success_probability: Option<f64>,
    pub achieved_success_ci_half_width: Option<f64>,
    pub iterations: Vec<WithdrawalSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolveError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("invalid solver settings: {0}")]
    Settings(String),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

/// Largest annual withdrawal whose success probability still meets the
/// target. Every candidate reuses one seed, so success probability is
/// non-increasing in the withdrawal and bisection is well defined.
pub fn solve_max_withdrawal<M: ReturnModel + ?Sized>(
    base: &SimulationConfig,
    model: &M,
    policy: AggregationPolicy,
    config: WithdrawalSolveConfig,
) -> Result<WithdrawalSolveResult, SolveError> {
    base.validate()?;
    validate_solve_config(config)?;

    let seed = base.seed.unwrap_or_else(fresh_seed);
    let evaluate = |withdrawal: f64, simulations: u32| {
        evaluate_candidate(base, model, policy, seed, withdrawal, simulations)
    };

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate(config.search_min, config.simulations_per_iteration)?;
    let high_eval = evaluate(config.search_max, config.simulations_per_iteration)?;

    let mut solved_withdrawal = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.success_probability + 1e-12 < config.target_success_probability {
        feasible = false;
        message = "No feasible withdrawal found within the search bounds.".to_string();
    } else if high_eval.success_probability + 1e-12 >= config.target_success_probability {
        solved_withdrawal = Some(config.search_max);
        converged = true;
        feasible = true;
        message = "Upper withdrawal bound is still feasible; \
                   increase search max for a tighter answer."
            .to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate(mid, config.simulations_per_iteration)?;
            iterations.push(WithdrawalSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_withdrawal: mid,
                success_probability: eval.success_probability,
                success_ci_half_width: eval.success_ci_half_width,
            });

            if eval.success_probability + 1e-12 >= config.target_success_probability {
                lo = mid;
            } else {
                hi = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved_withdrawal = Some(lo);
        feasible = true;
        message = if converged {
            "Solved maximum sustainable withdrawal.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let mut achieved_success_probability = None;
    let mut achieved_success_ci_half_width = None;
    if let Some(value) = solved_withdrawal {
        let final_eval = evaluate(value, config.final_simulations)?;
        achieved_success_probability = Some(final_eval.success_probability);
        achieved_success_ci_half_width = Some(final_eval.success_ci_half_width);
    }

    Ok(WithdrawalSolveResult {
        target_success_probability: config.target_success_probability,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        seed,
        solved_withdrawal,
        solved_withdrawal_rate: solved_withdrawal.map(|w| w / base.initial_wealth),
        achieved_success_probability,
        achieved_success_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    success_probability: f64,
    success_ci_half_width: f64,
}

fn evaluate_candidate<M: ReturnModel + ?Sized>(
    base: &SimulationConfig,
    model: &M,
    policy: AggregationPolicy,
    seed: u64,
    withdrawal: f64,
    simulations: u32,
) -> Result<CandidateEval, SimulationError> {
    let config = SimulationConfig {
        withdrawal_amount: withdrawal.max(0.0),
        simulation_count: simulations,
        seed: Some(seed),
        ..base.clone()
    };
    let result = run_simulation(&config, seed, model, policy)?;
    Ok(CandidateEval {
        success_probability: result.success_probability,
        success_ci_half_width: binomial_ci_half_width(
            result.success_probability / 100.0,
            simulations,
        ) * 100.0,
    })
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_solve_config(config: WithdrawalSolveConfig) -> Result<(), SolveError> {
    let settings = |msg: &str| Err(SolveError::Settings(msg.to_string()));
    if !(0.0..=100.0).contains(&config.target_success_probability) {
        return settings("target_success_probability must be between 0 and 100");
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return settings("search bounds must be finite");
    }
    if config.search_min < 0.0 {
        return settings("search_min must be >= 0");
    }
    if config.search_max <= config.search_min {
        return settings("search_max must be greater than search_min");
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return settings("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return settings("max_iterations must be > 0");
    }
    for simulations in [config.simulations_per_iteration, config.final_simulations] {
        if !(MIN_SIMULATIONS..=MAX_SIMULATIONS).contains(&simulations) {
            return settings("simulation counts must be between 100 and 100000");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::returns::BlendedNormalModel;

    fn base_config() -> SimulationConfig {
        SimulationConfig {
            initial_wealth: 1_000_000.0,
            time_horizon_years: 30,
            withdrawal_amount: 0.0,
            risk_score: 6,
            inflation_rate: 2.0,
            simulation_count: 500,
            seed: Some(11),
        }
    }

    fn solve_config() -> WithdrawalSolveConfig {
        WithdrawalSolveConfig {
            target_success_probability: 90.0,
            search_min: 0.0,
            search_max: 150_000.0,
            tolerance: 500.0,
            max_iterations: 30,
            simulations_per_iteration: 400,
            final_simulations: 1_000,
        }
    }

    #[test]
    fn solver_finds_interior_withdrawal_meeting_target() {
        let base = base_config();
        let model = BlendedNormalModel::new(base.risk_score);
        let policy = AggregationPolicy::default();
        let result = solve_max_withdrawal(&base, &model, policy, solve_config()).expect("solve");

        assert!(result.feasible);
        assert!(result.converged);
        let solved = result.solved_withdrawal.expect("solved value");
        assert!(solved > 0.0 && solved < 150_000.0, "solved {solved}");
        assert!(!result.iterations.is_empty());
        let last = result.iterations.last().expect("iteration");
        assert!(last.upper_bound - last.lower_bound <= 2.0 * 500.0 + 1e-9);
        assert_eq!(result.seed, 11);
        assert!(result.solved_withdrawal_rate.is_some_and(|r| r > 0.0 && r < 0.15));
    }

    #[test]
    fn solver_reports_upper_bound_when_still_feasible() {
        let base = base_config();
        let model = BlendedNormalModel::new(base.risk_score);
        let mut config = solve_config();
        config.search_max = 100.0;
        let policy = AggregationPolicy::default();
        let result = solve_max_withdrawal(&base, &model, policy, config).expect("solve");
        assert_eq!(result.solved_withdrawal, Some(100.0));
        assert!(result.iterations.is_empty());
    }

    #[test]
    fn solver_reports_infeasible_when_lower_bound_fails() {
        let base = base_config();
        let model = BlendedNormalModel::new(base.risk_score);
        let mut config = solve_config();
        config.search_min = 400_000.0;
        config.search_max = 500_000.0;
        let policy = AggregationPolicy::default();
        let result = solve_max_withdrawal(&base, &model, policy, config).expect("solve");
        assert!(!result.feasible);
        assert_eq!(result.solved_withdrawal, None);
        assert_eq!(result.achieved_success_probability, None);
    }

    #[test]
    fn solver_rejects_invalid_settings() {
        let base = base_config();
        let model = BlendedNormalModel::new(base.risk_score);
        let mut config = solve_config();
        config.search_max = config.search_min;
        let policy = AggregationPolicy::default();
        let err = solve_max_withdrawal(&base, &model, policy, config)
            .expect_err("must reject empty range");
        assert!(matches!(err, SolveError::Settings(msg) if msg.contains("search_max")));

        let mut bad_base = base_config();
        bad_base.time_horizon_years = 0;
        let err = solve_max_withdrawal(&bad_base, &model, policy, solve_config())
            .expect_err("must reject config");
        assert!(matches!(err, SolveError::Configuration(_)));
    }

    #[test]
    fn binomial_half_width_shrinks_with_samples() {
        assert!(binomial_ci_half_width(0.5, 1_000) < binomial_ci_half_width(0.5, 100));
        assert_eq!(binomial_ci_half_width(1.0, 100), 0.0);
        assert_eq!(binomial_ci_half_width(0.5, 0), 0.0);
    }
}
