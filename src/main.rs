//! This file defines the dmrpp-store server binary entry point.

use dmrpp_store::app;
use dmrpp_store::app_state::AppState;
use dmrpp_store::cli;
use dmrpp_store::metrics;
use dmrpp_store::server;
use dmrpp_store::tracing;

use std::process::ExitCode;
use std::sync::Arc;

/// Application entry point
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing(&args);
    ::tracing::debug!("{:?}", args);
    metrics::register_metrics();
    let state = match AppState::new(&args) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            ::tracing::error!("failed to initialise: {}", err);
            tracing::shutdown_tracing();
            return ExitCode::FAILURE;
        }
    };
    let service = app::service(state);
    let result = server::serve(&args, service).await;
    tracing::shutdown_tracing();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("dmrpp-store: {}", err);
            ExitCode::FAILURE
        }
    }
}
