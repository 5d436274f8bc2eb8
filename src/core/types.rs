use serde::{Deserialize, Serialize};

use super::aggregate::RunningStats;
use super::error::ConfigurationError;

pub const MIN_HORIZON_YEARS: u32 = 1;
pub const MAX_HORIZON_YEARS: u32 = 50;
pub const MIN_RISK_SCORE: u32 = 1;
pub const MAX_RISK_SCORE: u32 = 10;
pub const MIN_SIMULATIONS: u32 = 100;
pub const MAX_SIMULATIONS: u32 = 100_000;

/// Inputs for one run. `inflation_rate` is a percentage (2.5 means 2.5%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub initial_wealth: f64,
    pub time_horizon_years: u32,
    pub withdrawal_amount: f64,
    pub risk_score: u32,
    pub inflation_rate: f64,
    pub simulation_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.initial_wealth.is_finite() || self.initial_wealth <= 0.0 {
            return Err(ConfigurationError::InitialWealth(self.initial_wealth));
        }
        if !(MIN_HORIZON_YEARS..=MAX_HORIZON_YEARS).contains(&self.time_horizon_years) {
            return Err(ConfigurationError::TimeHorizon {
                got: self.time_horizon_years,
                min: MIN_HORIZON_YEARS,
                max: MAX_HORIZON_YEARS,
            });
        }
        if !self.withdrawal_amount.is_finite() || self.withdrawal_amount < 0.0 {
            return Err(ConfigurationError::WithdrawalAmount(self.withdrawal_amount));
        }
        if !(MIN_RISK_SCORE..=MAX_RISK_SCORE).contains(&self.risk_score) {
            return Err(ConfigurationError::RiskScore {
                got: self.risk_score,
                min: MIN_RISK_SCORE,
                max: MAX_RISK_SCORE,
            });
        }
        if !self.inflation_rate.is_finite() || self.inflation_rate < 0.0 {
            return Err(ConfigurationError::InflationRate(self.inflation_rate));
        }
        if !(MIN_SIMULATIONS..=MAX_SIMULATIONS).contains(&self.simulation_count) {
            return Err(ConfigurationError::SimulationCount {
                got: self.simulation_count,
                min: MIN_SIMULATIONS,
                max: MAX_SIMULATIONS,
            });
        }
        Ok(())
    }

    pub fn inflation_fraction(&self) -> f64 {
        self.inflation_rate / 100.0
    }

    pub fn withdrawal_rate(&self) -> f64 {
        self.withdrawal_amount / self.initial_wealth
    }

    /// Withdrawal due in `year` (1-based), grown by inflation from year one.
    pub fn required_withdrawal(&self, year: u32) -> f64 {
        let growth = 1.0 + self.inflation_fraction();
        self.withdrawal_amount * growth.powi(year.saturating_sub(1) as i32)
    }
}

/// One simulated lifetime, folded into the aggregate and then dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialOutcome {
    pub final_wealth: f64,
    pub success: bool,
    pub depletion_year: Option<u32>,
    pub max_drawdown_percent: f64,
    /// Unmet part of the withdrawal in the depletion year; 0 for successful trials.
    pub shortfall: f64,
    pub returns: RunningStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationProgress {
    pub completed: u32,
    pub total: u32,
    pub progress_percent: f64,
}

impl SimulationProgress {
    pub fn new(completed: u32, total: u32) -> Self {
        let completed = completed.min(total);
        let progress_percent = if total == 0 {
            100.0
        } else {
            100.0 * completed as f64 / total as f64
        };
        Self {
            completed,
            total,
            progress_percent,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceIntervals {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub success_probability: f64,
    pub shortfall_risk: f64,
    pub average_final_wealth: f64,
    pub median_final_wealth: f64,
    pub confidence_intervals: ConfidenceIntervals,
    pub average_shortfall: f64,
    pub average_depletion_year: Option<f64>,
    pub max_drawdown_percent: f64,
    pub volatility_percent: f64,
    pub simulation_count: u32,
    pub seed: u64,
    pub execution_time_ms: u64,
}
