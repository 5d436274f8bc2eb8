use serde::{Deserialize, Serialize};

use super::error::SimulationError;
use super::types::{ConfidenceIntervals, SimulationResult, TrialOutcome};

/// How the per-trial drawdowns collapse into the reported figure.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrawdownPolicy {
    #[default]
    WorstTrial,
    MeanTrial,
    MedianTrial,
}

/// How sampled annual returns become `volatilityPercent`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolatilityPolicy {
    /// Standard deviation of every sampled return across all trials and years.
    #[default]
    PooledReturns,
    /// Mean of the per-trial standard deviations.
    MeanTrial,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationPolicy {
    pub drawdown: DrawdownPolicy,
    pub volatility: VolatilityPolicy,
}

/// Welford running moments; `merge` combines two disjoint sets exactly
/// (Chan et al.), so trials can summarise their own returns.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / count as f64;
        let weight = self.count as f64 * other.count as f64 / count as f64;
        self.m2 += other.m2 + delta * delta * weight;
        self.count = count;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0).sqrt()
    }
}

/// Neumaier-compensated sum.
#[derive(Debug, Clone, Copy, Default)]
struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    fn total(&self) -> f64 {
        self.sum + self.compensation
    }
}

/// Folds trial outcomes into a `SimulationResult`.
///
/// Working state is running sums plus one retained final-wealth sample
/// (at most 100k values), and a drawdown sample only under
/// `DrawdownPolicy::MedianTrial`. Outcomes must be pushed in trial order for
/// the result to be bit-reproducible.
#[derive(Debug)]
pub struct Aggregator {
    policy: AggregationPolicy,
    trials: u32,
    successes: u32,
    final_wealth: Vec<f64>,
    wealth_sum: CompensatedSum,
    failures: u32,
    shortfall_sum: CompensatedSum,
    depletion_year_sum: u64,
    worst_drawdown: f64,
    drawdown_sum: CompensatedSum,
    drawdowns: Vec<f64>,
    pooled_returns: RunningStats,
    trial_volatility_sum: CompensatedSum,
}

impl Aggregator {
    pub fn new(expected_trials: u32, policy: AggregationPolicy) -> Self {
        let drawdown_capacity = match policy.drawdown {
            DrawdownPolicy::MedianTrial => expected_trials as usize,
            _ => 0,
        };
        Self {
            policy,
            trials: 0,
            successes: 0,
            final_wealth: Vec::with_capacity(expected_trials as usize),
            wealth_sum: CompensatedSum::default(),
            failures: 0,
            shortfall_sum: CompensatedSum::default(),
            depletion_year_sum: 0,
            worst_drawdown: 0.0,
            drawdown_sum: CompensatedSum::default(),
            drawdowns: Vec::with_capacity(drawdown_capacity),
            pooled_returns: RunningStats::default(),
            trial_volatility_sum: CompensatedSum::default(),
        }
    }

    pub fn trials(&self) -> u32 {
        self.trials
    }

    pub fn push(&mut self, outcome: &TrialOutcome) {
        self.trials += 1;
        if outcome.success {
            self.successes += 1;
        } else {
            self.failures += 1;
            self.shortfall_sum.add(outcome.shortfall);
            if let Some(year) = outcome.depletion_year {
                self.depletion_year_sum += year as u64;
            }
        }

        self.final_wealth.push(outcome.final_wealth);
        self.wealth_sum.add(outcome.final_wealth);

        self.worst_drawdown = self.worst_drawdown.max(outcome.max_drawdown_percent);
        self.drawdown_sum.add(outcome.max_drawdown_percent);
        if self.policy.drawdown == DrawdownPolicy::MedianTrial {
            self.drawdowns.push(outcome.max_drawdown_percent);
        }

        self.pooled_returns.merge(&outcome.returns);
        self.trial_volatility_sum.add(outcome.returns.std_dev());
    }

    pub fn finish(mut self) -> Result<SimulationResult, SimulationError> {
        if self.trials == 0 {
            return Err(SimulationError::runtime("no trials to aggregate"));
        }
        if let Some(bad) = self.final_wealth.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(SimulationError::runtime(format!(
                "invalid final wealth in trial sample: {bad}"
            )));
        }

        let n = self.trials as f64;
        self.final_wealth.sort_by(|a, b| a.total_cmp(b));
        let sorted = &self.final_wealth;

        let success_probability = 100.0 * self.successes as f64 / n;
        let (average_shortfall, average_depletion_year) = if self.failures == 0 {
            (0.0, None)
        } else {
            let failures = self.failures as f64;
            (
                self.shortfall_sum.total() / failures,
                Some(self.depletion_year_sum as f64 / failures),
            )
        };

        let max_drawdown_percent = match self.policy.drawdown {
            DrawdownPolicy::WorstTrial => self.worst_drawdown,
            DrawdownPolicy::MeanTrial => self.drawdown_sum.total() / n,
            DrawdownPolicy::MedianTrial => {
                self.drawdowns.sort_by(|a, b| a.total_cmp(b));
                percentile_sorted(&self.drawdowns, 50.0)
            }
        };
        let volatility_percent = match self.policy.volatility {
            VolatilityPolicy::PooledReturns => self.pooled_returns.std_dev() * 100.0,
            VolatilityPolicy::MeanTrial => self.trial_volatility_sum.total() / n * 100.0,
        };

        let result = SimulationResult {
            success_probability,
            shortfall_risk: 100.0 - success_probability,
            average_final_wealth: self.wealth_sum.total() / n,
            median_final_wealth: percentile_sorted(sorted, 50.0),
            confidence_intervals: ConfidenceIntervals {
                p10: percentile_sorted(sorted, 10.0),
                p25: percentile_sorted(sorted, 25.0),
                p50: percentile_sorted(sorted, 50.0),
                p75: percentile_sorted(sorted, 75.0),
                p90: percentile_sorted(sorted, 90.0),
            },
            average_shortfall,
            average_depletion_year,
            max_drawdown_percent,
            volatility_percent,
            simulation_count: self.trials,
            seed: 0,
            execution_time_ms: 0,
        };

        if !result.average_final_wealth.is_finite() || !result.volatility_percent.is_finite() {
            return Err(SimulationError::runtime("aggregate statistics are not finite"));
        }
        Ok(result)
    }
}

/// Linear-interpolated percentile of an ascending slice.
pub fn percentile_sorted(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn outcome(final_wealth: f64, drawdown: f64, returns: &[f64]) -> TrialOutcome {
        let mut stats = RunningStats::default();
        for r in returns {
            stats.push(*r);
        }
        TrialOutcome {
            final_wealth,
            success: final_wealth > 0.0,
            depletion_year: None,
            max_drawdown_percent: drawdown,
            shortfall: 0.0,
            returns: stats,
        }
    }

    fn failed(depletion_year: u32, shortfall: f64) -> TrialOutcome {
        TrialOutcome {
            final_wealth: 0.0,
            success: false,
            depletion_year: Some(depletion_year),
            max_drawdown_percent: 100.0,
            shortfall,
            returns: RunningStats::default(),
        }
    }

    #[test]
    fn percentile_interpolates_between_points() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_approx(percentile_sorted(&values, 25.0), 1.75);
        assert_approx(percentile_sorted(&values, 50.0), 2.5);
        assert_approx(percentile_sorted(&values, 100.0), 4.0);
        assert_approx(percentile_sorted(&[], 50.0), 0.0);
    }

    #[test]
    fn running_stats_merge_matches_single_pass() {
        let values = [0.1, -0.05, 0.2, 0.07, -0.3, 0.12];
        let mut whole = RunningStats::default();
        for v in values {
            whole.push(v);
        }

        let mut left = RunningStats::default();
        let mut right = RunningStats::default();
        for v in &values[..2] {
            left.push(*v);
        }
        for v in &values[2..] {
            right.push(*v);
        }
        left.merge(&right);

        assert_eq!(left.count(), 6);
        assert_approx(left.mean(), whole.mean());
        assert_approx(left.std_dev(), whole.std_dev());
    }

    #[test]
    fn compensated_sum_keeps_small_terms() {
        let mut sum = CompensatedSum::default();
        sum.add(1e16);
        for _ in 0..10 {
            sum.add(1.0);
        }
        sum.add(-1e16);
        assert_approx(sum.total(), 10.0);
    }

    #[test]
    fn finish_reports_success_shortfall_and_percentiles() {
        let mut agg = Aggregator::new(4, AggregationPolicy::default());
        agg.push(&outcome(100.0, 10.0, &[0.1, -0.1]));
        agg.push(&outcome(300.0, 20.0, &[0.1, -0.1]));
        agg.push(&failed(7, 40.0));
        agg.push(&failed(9, 20.0));
        assert_eq!(agg.trials(), 4);

        let result = agg.finish().expect("aggregate");
        assert_approx(result.success_probability, 50.0);
        assert_approx(result.shortfall_risk, 50.0);
        assert_approx(result.average_final_wealth, 100.0);
        assert_approx(result.median_final_wealth, 50.0);
        assert_approx(result.confidence_intervals.p75, 150.0);
        assert_approx(result.average_shortfall, 30.0);
        assert_eq!(result.average_depletion_year, Some(8.0));
        assert_approx(result.max_drawdown_percent, 100.0);
        assert_approx(result.volatility_percent, 10.0);
        assert_eq!(result.simulation_count, 4);
    }

    #[test]
    fn all_failures_are_not_an_error() {
        let mut agg = Aggregator::new(3, AggregationPolicy::default());
        for year in [3, 4, 5] {
            agg.push(&failed(year, 1_000.0));
        }
        let result = agg.finish().expect("aggregate");
        assert_approx(result.success_probability, 0.0);
        assert_approx(result.shortfall_risk, 100.0);
        assert_approx(result.confidence_intervals.p90, 0.0);
        assert_approx(result.average_shortfall, 1_000.0);
    }

    #[test]
    fn drawdown_policies_select_different_figures() {
        let outcomes = [
            outcome(1.0, 10.0, &[0.0]),
            outcome(1.0, 20.0, &[0.0]),
            outcome(1.0, 60.0, &[0.0]),
        ];
        let run = |drawdown| {
            let mut agg = Aggregator::new(
                3,
                AggregationPolicy {
                    drawdown,
                    volatility: VolatilityPolicy::PooledReturns,
                },
            );
            for o in &outcomes {
                agg.push(o);
            }
            agg.finish().expect("aggregate").max_drawdown_percent
        };
        assert_approx(run(DrawdownPolicy::WorstTrial), 60.0);
        assert_approx(run(DrawdownPolicy::MeanTrial), 30.0);
        assert_approx(run(DrawdownPolicy::MedianTrial), 20.0);
    }

    #[test]
    fn volatility_policies_differ_when_trial_means_differ() {
        let policy = |volatility| AggregationPolicy {
            drawdown: DrawdownPolicy::WorstTrial,
            volatility,
        };
        let outcomes = [outcome(1.0, 0.0, &[0.1, 0.1]), outcome(1.0, 0.0, &[-0.1, -0.1])];

        let mut pooled = Aggregator::new(2, policy(VolatilityPolicy::PooledReturns));
        let mut mean = Aggregator::new(2, policy(VolatilityPolicy::MeanTrial));
        for o in &outcomes {
            pooled.push(o);
            mean.push(o);
        }
        assert_approx(pooled.finish().expect("pooled").volatility_percent, 10.0);
        assert_approx(mean.finish().expect("mean").volatility_percent, 0.0);
    }

    #[test]
    fn empty_or_non_finite_samples_are_runtime_errors() {
        let agg = Aggregator::new(0, AggregationPolicy::default());
        assert!(matches!(agg.finish(), Err(SimulationError::Runtime(_))));

        let mut agg = Aggregator::new(1, AggregationPolicy::default());
        agg.push(&outcome(f64::NAN, 0.0, &[0.0]));
        assert!(matches!(agg.finish(), Err(SimulationError::Runtime(_))));
    }

    proptest! {
        #[test]
        fn prop_percentiles_are_monotone(values in vec(0.0f64..1e7, 100..400)) {
            let mut agg = Aggregator::new(values.len() as u32, AggregationPolicy::default());
            for v in &values {
                agg.push(&outcome(*v, 0.0, &[0.05]));
            }
            let result = agg.finish().expect("aggregate");
            let ci = result.confidence_intervals;
            prop_assert!(ci.p10 <= ci.p25);
            prop_assert!(ci.p25 <= ci.p50);
            prop_assert!(ci.p50 <= ci.p75);
            prop_assert!(ci.p75 <= ci.p90);
            prop_assert!((0.0..=100.0).contains(&result.success_probability));
            let complement = 100.0 - result.success_probability;
            prop_assert!((result.shortfall_risk - complement).abs() < 1e-12);
        }
    }
}
