//! Sets up logging and trace export globally.

use std::error::Error;

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_semantic_conventions as semcov;
use tonic::metadata::{MetadataMap, MetadataValue};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::TracerConfig;

pub struct GlobalTracing;

/// Installs a JSON log subscriber and an OTLP trace exporter as the global
/// providers. Must be called from within a Tokio runtime.
///
/// The tracing provider will be unregistered on drop.
///
/// Log levels follow `RUST_LOG`, defaulting to INFO, or DEBUG when the
/// configuration is verbose. Exporter options not covered by
/// [`TracerConfig`] are read from the standard environment variables:
///
///   * https://opentelemetry.io/docs/languages/sdk-configuration/otlp-exporter/
pub fn init_tracing(config: &TracerConfig) -> Result<GlobalTracing, Box<dyn Error + Send + Sync>> {
    let mut exporter = opentelemetry_otlp::new_exporter().tonic();
    if let Some(endpoint) = &config.endpoint {
        exporter = exporter.with_endpoint(endpoint);
    }
    if let Some(token) = &config.token {
        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", MetadataValue::try_from(token.as_str())?);
        exporter = exporter.with_metadata(metadata);
    }

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new(semcov::resource::SERVICE_NAME, config.service_name.clone()),
                KeyValue::new(semcov::resource::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    tracing_subscriber::registry()
        .with(
            tracing_opentelemetry::layer()
                .with_error_records_to_exceptions(true)
                .with_tracer(tracer),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level(config).into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_timer(tracing_subscriber::fmt::time::time()),
        )
        .try_init()?;

    Ok(GlobalTracing)
}

fn default_level(config: &TracerConfig) -> LevelFilter {
    if config.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

impl Drop for GlobalTracing {
    fn drop(&mut self) {
        global::shutdown_tracer_provider();
    }
}
