use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::core::{
    AggregationPolicy, AssetAssumptions, DrawdownPolicy, SimulationConfig, VolatilityPolicy,
    WithdrawalSolveConfig,
};
use crate::orchestrator::ScenarioMeta;
use crate::unit::UnitOptions;

use super::ApiError;

pub const DEFAULT_UNIT_TIMEOUT_SECS: u64 = 120;

#[derive(Parser, Debug)]
#[command(
    name = "glidepath",
    about = "Monte Carlo retirement drawdown simulator with inflation-linked withdrawals"
)]
pub struct Cli {
    /// Seconds a computation unit may stay silent before the run is failed.
    #[arg(long, global = true, default_value_t = DEFAULT_UNIT_TIMEOUT_SECS)]
    pub unit_timeout_secs: u64,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(default_value_t = 8080)]
        port: u16,
    },
    /// Run one simulation and print the result as JSON.
    Run(SimulationArgs),
    /// Search for the largest withdrawal that meets a success target.
    Solve(SolveArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliDrawdownPolicy {
    WorstTrial,
    MeanTrial,
    MedianTrial,
}

impl From<CliDrawdownPolicy> for DrawdownPolicy {
    fn from(value: CliDrawdownPolicy) -> Self {
        match value {
            CliDrawdownPolicy::WorstTrial => DrawdownPolicy::WorstTrial,
            CliDrawdownPolicy::MeanTrial => DrawdownPolicy::MeanTrial,
            CliDrawdownPolicy::MedianTrial => DrawdownPolicy::MedianTrial,
        }
    }
}

impl From<DrawdownPolicy> for CliDrawdownPolicy {
    fn from(value: DrawdownPolicy) -> Self {
        match value {
            DrawdownPolicy::WorstTrial => CliDrawdownPolicy::WorstTrial,
            DrawdownPolicy::MeanTrial => CliDrawdownPolicy::MeanTrial,
            DrawdownPolicy::MedianTrial => CliDrawdownPolicy::MedianTrial,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliVolatilityPolicy {
    PooledReturns,
    MeanTrial,
}

impl From<CliVolatilityPolicy> for VolatilityPolicy {
    fn from(value: CliVolatilityPolicy) -> Self {
        match value {
            CliVolatilityPolicy::PooledReturns => VolatilityPolicy::PooledReturns,
            CliVolatilityPolicy::MeanTrial => VolatilityPolicy::MeanTrial,
        }
    }
}

impl From<VolatilityPolicy> for CliVolatilityPolicy {
    fn from(value: VolatilityPolicy) -> Self {
        match value {
            VolatilityPolicy::PooledReturns => CliVolatilityPolicy::PooledReturns,
            VolatilityPolicy::MeanTrial => CliVolatilityPolicy::MeanTrial,
        }
    }
}

/// Simulation inputs. Rates are in percent on the command line.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct SimulationArgs {
    #[arg(long, default_value_t = 500_000.0)]
    pub initial_wealth: f64,
    #[arg(long, default_value_t = 30)]
    pub time_horizon_years: u32,
    #[arg(long, default_value_t = 25_000.0, help = "First-year withdrawal, grown by inflation")]
    pub withdrawal_amount: f64,
    #[arg(long, default_value_t = 5, help = "Risk score from 1 (cautious) to 10 (aggressive)")]
    pub risk_score: u32,
    #[arg(long, default_value_t = 2.5, help = "Annual inflation in percent")]
    pub inflation_rate: f64,
    #[arg(long, default_value_t = 5_000)]
    pub simulations: u32,
    #[arg(long, help = "Seed for reproducible runs; random when omitted")]
    pub seed: Option<u64>,
    #[arg(long, help = "Trials between progress checkpoints; defaults to 2% of the run")]
    pub batch_size: Option<u32>,
    #[arg(long, value_enum, default_value_t = CliDrawdownPolicy::WorstTrial)]
    pub drawdown_policy: CliDrawdownPolicy,
    #[arg(long, value_enum, default_value_t = CliVolatilityPolicy::PooledReturns)]
    pub volatility_policy: CliVolatilityPolicy,
    #[arg(long, help = "Equity expected real return in percent")]
    pub equity_return: Option<f64>,
    #[arg(long, help = "Equity return volatility in percent")]
    pub equity_volatility: Option<f64>,
    #[arg(long, help = "Bond expected real return in percent")]
    pub bond_return: Option<f64>,
    #[arg(long, help = "Bond return volatility in percent")]
    pub bond_volatility: Option<f64>,
    #[arg(long, help = "Cash expected real return in percent")]
    pub cash_return: Option<f64>,
    #[arg(long, help = "Cash return volatility in percent")]
    pub cash_volatility: Option<f64>,
}

impl Default for SimulationArgs {
    fn default() -> Self {
        Self {
            initial_wealth: 500_000.0,
            time_horizon_years: 30,
            withdrawal_amount: 25_000.0,
            risk_score: 5,
            inflation_rate: 2.5,
            simulations: 5_000,
            seed: None,
            batch_size: None,
            drawdown_policy: CliDrawdownPolicy::WorstTrial,
            volatility_policy: CliVolatilityPolicy::PooledReturns,
            equity_return: None,
            equity_volatility: None,
            bond_return: None,
            bond_volatility: None,
            cash_return: None,
            cash_volatility: None,
        }
    }
}

impl SimulationArgs {
    fn assumptions(&self) -> Option<AssetAssumptions> {
        let overrides = [
            self.equity_return,
            self.equity_volatility,
            self.bond_return,
            self.bond_volatility,
            self.cash_return,
            self.cash_volatility,
        ];
        if overrides.iter().all(Option::is_none) {
            return None;
        }

        let mut assumptions = AssetAssumptions::default();
        set_pct(&mut assumptions.equities.mean, self.equity_return);
        set_pct(&mut assumptions.equities.volatility, self.equity_volatility);
        set_pct(&mut assumptions.bonds.mean, self.bond_return);
        set_pct(&mut assumptions.bonds.volatility, self.bond_volatility);
        set_pct(&mut assumptions.cash.mean, self.cash_return);
        set_pct(&mut assumptions.cash.volatility, self.cash_volatility);
        Some(assumptions)
    }
}

fn set_pct(target: &mut f64, percent: Option<f64>) {
    if let Some(value) = percent {
        *target = value / 100.0;
    }
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct SolveArgs {
    #[command(flatten)]
    pub simulation: SimulationArgs,
    #[arg(long, default_value_t = 90.0, help = "Required success probability in percent")]
    pub target_success: f64,
    #[arg(long, default_value_t = 0.0)]
    pub search_min: f64,
    #[arg(long, help = "Upper withdrawal bound; defaults to 20% of initial wealth")]
    pub search_max: Option<f64>,
    #[arg(long, default_value_t = 100.0)]
    pub tolerance: f64,
    #[arg(long, default_value_t = 30)]
    pub max_iterations: u32,
    #[arg(long, default_value_t = 1_000)]
    pub simulations_per_iteration: u32,
    #[arg(long, default_value_t = 5_000)]
    pub final_simulations: u32,
}

impl Default for SolveArgs {
    fn default() -> Self {
        Self {
            simulation: SimulationArgs::default(),
            target_success: 90.0,
            search_min: 0.0,
            search_max: None,
            tolerance: 100.0,
            max_iterations: 30,
            simulations_per_iteration: 1_000,
            final_simulations: 5_000,
        }
    }
}

/// A validated simulation: what to run, how the unit runs it, and where the
/// result is filed.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRequest {
    pub config: SimulationConfig,
    pub options: UnitOptions,
    pub meta: Option<ScenarioMeta>,
}

#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub config: SimulationConfig,
    pub options: UnitOptions,
    pub solve: WithdrawalSolveConfig,
}

pub fn build_request(args: SimulationArgs) -> Result<SimulationRequest, ApiError> {
    let config = SimulationConfig {
        initial_wealth: args.initial_wealth,
        time_horizon_years: args.time_horizon_years,
        withdrawal_amount: args.withdrawal_amount,
        risk_score: args.risk_score,
        inflation_rate: args.inflation_rate,
        simulation_count: args.simulations,
        seed: args.seed,
    };
    config.validate()?;

    let options = UnitOptions {
        batch_size: args.batch_size,
        policy: AggregationPolicy {
            drawdown: args.drawdown_policy.into(),
            volatility: args.volatility_policy.into(),
        },
        assumptions: args.assumptions(),
    };
    options.validate()?;

    Ok(SimulationRequest {
        config,
        options,
        meta: None,
    })
}

pub fn build_solve_request(args: SolveArgs) -> Result<SolveRequest, ApiError> {
    let search_max = args
        .search_max
        .unwrap_or(args.simulation.initial_wealth * 0.2);
    let SimulationRequest {
        config, options, ..
    } = build_request(args.simulation)?;

    Ok(SolveRequest {
        config,
        options,
        solve: WithdrawalSolveConfig {
            target_success_probability: args.target_success,
            search_min: args.search_min,
            search_max,
            tolerance: args.tolerance,
            max_iterations: args.max_iterations,
            simulations_per_iteration: args.simulations_per_iteration,
            final_simulations: args.final_simulations,
        },
    })
}

/// Optional overrides accepted by `/api/simulate`, as a JSON body or query
/// string. Missing fields keep the command-line defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulatePayload {
    initial_wealth: Option<f64>,
    #[serde(alias = "timeHorizon", alias = "years")]
    time_horizon_years: Option<u32>,
    #[serde(alias = "annualWithdrawal")]
    withdrawal_amount: Option<f64>,
    risk_score: Option<u32>,
    inflation_rate: Option<f64>,
    #[serde(alias = "simulationCount")]
    simulations: Option<u32>,
    seed: Option<u64>,
    batch_size: Option<u32>,
    drawdown_policy: Option<DrawdownPolicy>,
    volatility_policy: Option<VolatilityPolicy>,

    equity_return: Option<f64>,
    equity_volatility: Option<f64>,
    bond_return: Option<f64>,
    bond_volatility: Option<f64>,
    cash_return: Option<f64>,
    cash_volatility: Option<f64>,

    subject_id: Option<String>,
    scenario_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SolvePayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    #[serde(alias = "targetSuccessProbability")]
    target_success: Option<f64>,
    search_min: Option<f64>,
    search_max: Option<f64>,
    tolerance: Option<f64>,
    max_iterations: Option<u32>,
    simulations_per_iteration: Option<u32>,
    final_simulations: Option<u32>,
}

pub fn request_from_payload(payload: SimulatePayload) -> Result<SimulationRequest, ApiError> {
    let meta = scenario_meta(payload.subject_id.clone(), payload.scenario_name.clone())?;
    let mut request = build_request(args_from_payload(payload))?;
    request.meta = meta;
    Ok(request)
}

pub fn solve_request_from_payload(payload: SolvePayload) -> Result<SolveRequest, ApiError> {
    let mut args = SolveArgs {
        simulation: args_from_payload(payload.simulation),
        ..SolveArgs::default()
    };
    if let Some(v) = payload.target_success {
        args.target_success = v;
    }
    if let Some(v) = payload.search_min {
        args.search_min = v;
    }
    if payload.search_max.is_some() {
        args.search_max = payload.search_max;
    }
    if let Some(v) = payload.tolerance {
        args.tolerance = v;
    }
    if let Some(v) = payload.max_iterations {
        args.max_iterations = v;
    }
    if let Some(v) = payload.simulations_per_iteration {
        args.simulations_per_iteration = v;
    }
    if let Some(v) = payload.final_simulations {
        args.final_simulations = v;
    }
    build_solve_request(args)
}

fn args_from_payload(payload: SimulatePayload) -> SimulationArgs {
    let mut args = SimulationArgs::default();

    if let Some(v) = payload.initial_wealth {
        args.initial_wealth = v;
    }
    if let Some(v) = payload.time_horizon_years {
        args.time_horizon_years = v;
    }
    if let Some(v) = payload.withdrawal_amount {
        args.withdrawal_amount = v;
    }
    if let Some(v) = payload.risk_score {
        args.risk_score = v;
    }
    if let Some(v) = payload.inflation_rate {
        args.inflation_rate = v;
    }
    if let Some(v) = payload.simulations {
        args.simulations = v;
    }
    if let Some(v) = payload.drawdown_policy {
        args.drawdown_policy = v.into();
    }
    if let Some(v) = payload.volatility_policy {
        args.volatility_policy = v.into();
    }
    args.seed = payload.seed;
    args.batch_size = payload.batch_size;
    args.equity_return = payload.equity_return;
    args.equity_volatility = payload.equity_volatility;
    args.bond_return = payload.bond_return;
    args.bond_volatility = payload.bond_volatility;
    args.cash_return = payload.cash_return;
    args.cash_volatility = payload.cash_volatility;
    args
}

fn scenario_meta(
    subject_id: Option<String>,
    scenario_name: Option<String>,
) -> Result<Option<ScenarioMeta>, ApiError> {
    match (subject_id, scenario_name) {
        (None, None) => Ok(None),
        (Some(subject_id), Some(scenario_name)) => Ok(Some(ScenarioMeta {
            subject_id,
            scenario_name,
        })),
        _ => Err(ApiError::InvalidRequest(
            "subjectId and scenarioName must be given together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConfigurationError;

    const EPS: f64 = 1e-12;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn request_from_json(json: &str) -> Result<SimulationRequest, ApiError> {
        let payload = serde_json::from_str::<SimulatePayload>(json)
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid API JSON payload: {e}")))?;
        request_from_payload(payload)
    }

    #[test]
    fn clap_defaults_match_api_defaults() {
        let cli = Cli::try_parse_from(["glidepath", "run"]).expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args, SimulationArgs::default());
        assert_eq!(cli.unit_timeout_secs, DEFAULT_UNIT_TIMEOUT_SECS);

        let cli = Cli::try_parse_from(["glidepath", "solve"]).expect("parse");
        let Command::Solve(args) = cli.command else {
            panic!("expected solve command");
        };
        assert_eq!(args, SolveArgs::default());
    }

    #[test]
    fn serve_takes_positional_port() {
        let cli = Cli::try_parse_from(["glidepath", "serve", "9000", "--unit-timeout-secs", "5"])
            .expect("parse");
        assert!(matches!(cli.command, Command::Serve { port: 9000 }));
        assert_eq!(cli.unit_timeout_secs, 5);
    }

    #[test]
    fn cli_flags_use_percent_units() {
        let cli = Cli::try_parse_from([
            "glidepath",
            "run",
            "--inflation-rate",
            "3",
            "--equity-return",
            "6",
            "--bond-volatility",
            "4.5",
            "--drawdown-policy",
            "median-trial",
            "--seed",
            "7",
        ])
        .expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let request = build_request(args).expect("valid request");

        assert_approx(request.config.inflation_rate, 3.0);
        assert_approx(request.config.inflation_fraction(), 0.03);
        assert_eq!(request.config.seed, Some(7));
        assert_eq!(request.options.policy.drawdown, DrawdownPolicy::MedianTrial);

        let assumptions = request.options.assumptions.expect("overrides applied");
        assert_approx(assumptions.equities.mean, 0.06);
        assert_approx(assumptions.bonds.volatility, 0.045);
        assert_approx(assumptions.cash.mean, AssetAssumptions::default().cash.mean);
    }

    #[test]
    fn build_request_without_overrides_keeps_default_model() {
        let request = build_request(SimulationArgs::default()).expect("valid");
        assert_eq!(request.options.assumptions, None);
        assert_eq!(request.options.batch_size, None);
        assert_eq!(request.meta, None);
    }

    #[test]
    fn build_request_rejects_invalid_config() {
        let args = SimulationArgs {
            simulations: 50,
            ..SimulationArgs::default()
        };
        let err = build_request(args).expect_err("must reject");
        assert!(matches!(
            err,
            ApiError::Configuration(ConfigurationError::SimulationCount { got: 50, .. })
        ));

        let args = SimulationArgs {
            batch_size: Some(0),
            ..SimulationArgs::default()
        };
        let err = build_request(args).expect_err("must reject");
        assert!(matches!(err, ApiError::Configuration(ConfigurationError::BatchSize)));

        let args = SimulationArgs {
            equity_volatility: Some(-1.0),
            ..SimulationArgs::default()
        };
        let err = build_request(args).expect_err("must reject");
        assert!(err.to_string().contains("equities.volatility"));
    }

    #[test]
    fn request_from_json_parses_client_keys() {
        let json = r#"{
          "initialWealth": 800000,
          "timeHorizonYears": 35,
          "withdrawalAmount": 32000,
          "riskScore": 7,
          "inflationRate": 2.0,
          "simulationCount": 2000,
          "seed": 99,
          "batchSize": 40,
          "drawdownPolicy": "mean-trial",
          "volatilityPolicy": "mean-trial",
          "cashReturn": 0.5,
          "subjectId": "client-9",
          "scenarioName": "early retirement"
        }"#;
        let request = request_from_json(json).expect("valid payload");

        assert_approx(request.config.initial_wealth, 800_000.0);
        assert_eq!(request.config.time_horizon_years, 35);
        assert_eq!(request.config.risk_score, 7);
        assert_eq!(request.config.simulation_count, 2_000);
        assert_eq!(request.config.seed, Some(99));
        assert_eq!(request.options.batch_size, Some(40));
        assert_eq!(request.options.policy.drawdown, DrawdownPolicy::MeanTrial);
        assert_eq!(request.options.policy.volatility, VolatilityPolicy::MeanTrial);
        assert_approx(
            request.options.assumptions.expect("overrides").cash.mean,
            0.005,
        );
        assert_eq!(
            request.meta,
            Some(ScenarioMeta {
                subject_id: "client-9".to_string(),
                scenario_name: "early retirement".to_string(),
            })
        );
    }

    #[test]
    fn empty_payload_uses_defaults() {
        let request = request_from_json("{}").expect("valid payload");
        let defaults = build_request(SimulationArgs::default()).expect("valid");
        assert_eq!(request, defaults);
    }

    #[test]
    fn payload_aliases_are_accepted() {
        let request =
            request_from_json(r#"{"years": 20, "annualWithdrawal": 10000}"#).expect("valid");
        assert_eq!(request.config.time_horizon_years, 20);
        assert_approx(request.config.withdrawal_amount, 10_000.0);
    }

    #[test]
    fn half_scenario_metadata_is_rejected() {
        let err = request_from_json(r#"{"subjectId": "client-1"}"#).expect_err("must reject");
        assert!(matches!(err, ApiError::InvalidRequest(msg) if msg.contains("scenarioName")));
    }

    #[test]
    fn out_of_range_payload_is_a_configuration_error() {
        let err = request_from_json(r#"{"riskScore": 0}"#).expect_err("must reject");
        assert!(matches!(
            err,
            ApiError::Configuration(ConfigurationError::RiskScore { got: 0, .. })
        ));
    }

    #[test]
    fn solve_payload_merges_onto_solver_defaults() {
        let payload: SolvePayload = serde_json::from_str(
            r#"{"initialWealth": 1000000, "targetSuccessProbability": 85, "tolerance": 250}"#,
        )
        .expect("parse");
        let request = solve_request_from_payload(payload).expect("valid");

        assert_approx(request.config.initial_wealth, 1_000_000.0);
        assert_approx(request.solve.target_success_probability, 85.0);
        assert_approx(request.solve.tolerance, 250.0);
        assert_approx(request.solve.search_max, 200_000.0);
        assert_eq!(request.solve.max_iterations, 30);
    }
}
