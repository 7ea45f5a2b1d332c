//! Tracing (logging)

use crate::cli::CommandLineArgs;

use opentelemetry::global;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to enable debug
/// logging for this crate and tower_http if not set. With `--enable-jaeger`, spans are also
/// exported to a Jaeger agent.
///
/// # Arguments
///
/// * `args`: Command line arguments
pub fn init_tracing(args: &CommandLineArgs) {
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dmrpp_store=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer());
    if !args.enable_jaeger {
        subscriber.init();
        return;
    }
    global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
    match opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name("dmrpp-store")
        .install_simple()
    {
        Ok(tracer) => {
            subscriber
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
        Err(err) => {
            subscriber.init();
            tracing::error!("failed to initialise Jaeger tracer: {}", err);
        }
    }
}

/// Initialise logging for the builder CLI, which logs to stderr.
pub fn init_cli_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dmrpp_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Flush and shut down span export.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
