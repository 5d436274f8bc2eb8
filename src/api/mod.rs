mod params;

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Router,
    extract::{Json, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::core::{
    ConfigurationError, SimulationConfig, SimulationError, SimulationResult, SolveError,
    WithdrawalSolveResult, solve_max_withdrawal,
};
use crate::orchestrator::{
    InMemoryPersistence, Orchestrator, PersistenceError, ProgressUpdate, RunEvent, RunObserver,
    ScenarioRecord, StartError,
};

pub use params::{
    Cli, CliDrawdownPolicy, CliVolatilityPolicy, Command, DEFAULT_UNIT_TIMEOUT_SECS,
    SimulatePayload, SimulationArgs, SimulationRequest, SolveArgs, SolvePayload, SolveRequest,
    build_request, build_solve_request, request_from_payload, solve_request_from_payload,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("a run is already in progress")]
    Busy,
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error("run was cancelled before completing")]
    Cancelled,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<StartError> for ApiError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::Configuration(err) => ApiError::Configuration(err),
            StartError::RunInProgress(_) => ApiError::Busy,
            StartError::Unit(err) => ApiError::Simulation(err),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Configuration(_) | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::Simulation(err) if err.is_unresponsive() => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Simulation(_) | ApiError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Solve(SolveError::Configuration(_) | SolveError::Settings(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Solve(SolveError::Simulation(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), &self.to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    store: InMemoryPersistence,
    unit_timeout: Duration,
}

impl AppState {
    pub fn new(store: InMemoryPersistence, unit_timeout: Duration) -> Self {
        Self {
            store,
            unit_timeout,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    /// Inputs as run, with the seed that was actually used.
    pub config: SimulationConfig,
    pub result: SimulationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub progress_updates: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioListing {
    id: String,
    #[serde(flatten)]
    record: ScenarioRecord,
}

/// Logs progress through `tracing` and counts the updates it saw.
#[derive(Debug, Default)]
struct TracingObserver {
    verbose: bool,
    updates: u32,
}

impl RunObserver for TracingObserver {
    fn on_progress(&mut self, update: &ProgressUpdate) {
        self.updates += 1;
        let percent =
            100.0 * update.progress.completed as f64 / update.progress.total.max(1) as f64;
        if self.verbose {
            info!(
                completed = update.progress.completed,
                total = update.progress.total,
                eta_ms = update.estimated_remaining_ms,
                "{percent:.0}% done"
            );
        } else {
            debug!(
                run_id = update.run_id,
                completed = update.progress.completed,
                total = update.progress.total,
                "progress"
            );
        }
    }

    fn on_persistence_error(&mut self, error: &PersistenceError) {
        warn!(error = %error, "result delivered without being stored");
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/solve", post(solve_handler))
        .route("/api/scenarios", get(scenarios_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn run_http_server(port: u16, unit_timeout: Duration) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(AppState::new(InMemoryPersistence::new(), unit_timeout));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "simulation API listening");
    info!("local access: http://127.0.0.1:{port}/health");

    axum::serve(listener, app).await
}

/// Runs one simulation from command-line arguments, logging progress.
pub async fn run_once(
    args: SimulationArgs,
    unit_timeout: Duration,
) -> Result<SimulateResponse, ApiError> {
    let request = build_request(args)?;
    execute(request, None, unit_timeout, true).await
}

/// Runs the withdrawal solver on the calling thread.
pub fn run_solver(request: &SolveRequest) -> Result<WithdrawalSolveResult, ApiError> {
    let model = request.options.model(request.config.risk_score);
    let result = solve_max_withdrawal(
        &request.config,
        &model,
        request.options.policy,
        request.solve,
    )?;
    info!(
        seed = result.seed,
        feasible = result.feasible,
        converged = result.converged,
        solved_withdrawal = result.solved_withdrawal,
        "withdrawal solve finished"
    );
    Ok(result)
}

/// Drives a fresh orchestrator through one run. The unit is disposed when the
/// orchestrator drops, including on timeout.
async fn execute(
    request: SimulationRequest,
    store: Option<InMemoryPersistence>,
    unit_timeout: Duration,
    verbose: bool,
) -> Result<SimulateResponse, ApiError> {
    let observer = TracingObserver {
        verbose,
        updates: 0,
    };
    let mut orchestrator = Orchestrator::with_observer(request.options, observer);
    if let Some(store) = store {
        orchestrator = orchestrator.with_persistence(store);
    }

    let mut config = request.config;
    orchestrator.start_scenario(config.clone(), request.meta)?;

    match orchestrator.wait_for_terminal(Some(unit_timeout)).await {
        Some(RunEvent::Completed {
            result, record_id, ..
        }) => {
            config.seed = Some(result.seed);
            Ok(SimulateResponse {
                config,
                result,
                record_id,
                progress_updates: orchestrator.observer().updates,
            })
        }
        Some(RunEvent::Failed { error, .. }) => Err(error.into()),
        Some(RunEvent::Cancelled { .. }) => Err(ApiError::Cancelled),
        _ => Err(SimulationError::runtime("run ended without a result").into()),
    }
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Result<Response, ApiError> {
    simulate_handler_impl(state, payload).await
}

async fn simulate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Result<Response, ApiError> {
    simulate_handler_impl(state, payload).await
}

async fn simulate_handler_impl(
    state: AppState,
    payload: SimulatePayload,
) -> Result<Response, ApiError> {
    let request = request_from_payload(payload)?;
    let response = execute(request, Some(state.store), state.unit_timeout, false).await?;
    Ok(json_response(StatusCode::OK, response))
}

async fn solve_handler(Json(payload): Json<SolvePayload>) -> Result<Response, ApiError> {
    let request = solve_request_from_payload(payload)?;
    let result = tokio::task::spawn_blocking(move || run_solver(&request))
        .await
        .map_err(|e| SimulationError::runtime(format!("solver task failed: {e}")))??;
    Ok(json_response(StatusCode::OK, result))
}

async fn scenarios_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let listings: Vec<ScenarioListing> = state
        .store
        .records()?
        .into_iter()
        .map(|(id, record)| ScenarioListing { id, record })
        .collect();
    Ok(json_response(StatusCode::OK, listings))
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        json!({
            "error": msg,
            "status": status.as_u16(),
        }),
    )
}
