use std::time::Duration;

use clap::Parser;
use glidepath::api::{self, Cli, Command};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let unit_timeout = Duration::from_secs(cli.unit_timeout_secs);

    let outcome = match cli.command {
        Command::Serve { port } => api::run_http_server(port, unit_timeout)
            .await
            .map_err(|e| format!("Server error: {e}")),
        Command::Run(args) => match api::run_once(args, unit_timeout).await {
            Ok(response) => print_json(&response),
            Err(e) => Err(e.to_string()),
        },
        Command::Solve(args) => {
            match api::build_solve_request(args).and_then(|request| api::run_solver(&request)) {
                Ok(result) => print_json(&result),
                Err(e) => Err(e.to_string()),
            }
        }
    };

    if let Err(e) = outcome {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to encode result: {e}"))?;
    println!("{json}");
    Ok(())
}
