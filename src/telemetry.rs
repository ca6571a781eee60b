use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "genq=info";

/// Install the global subscriber: an `EnvFilter` (`RUST_LOG`, falling back to
/// `genq=info`), stdout formatting and, when a collector endpoint is given,
/// span export to Jaeger.
pub fn init(jaeger_endpoint: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let telemetry = match jaeger_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name("genq")
                .with_isahc()
                .with_timeout(std::time::Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter_layer = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(fmt::Layer::default())
        .try_init()?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}
