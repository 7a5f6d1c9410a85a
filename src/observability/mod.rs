//! # Observability
//!
//! Tracing initialization and shutdown. The subscriber always installs a
//! formatted layer driven by `RUST_LOG`; when tracing export is enabled
//! and an OTLP endpoint is configured, spans additionally flow to the
//! collector. Both the tracer provider and its shutdown are owned here;
//! nothing else in the crate touches global telemetry state.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::core::{Error, Result};

/// Handle over installed telemetry. Dropping it does nothing; call
/// `shutdown` to flush exporters.
pub struct Telemetry {
    otlp_installed: bool,
}

impl Telemetry {
    /// Install the tracing subscriber. Idempotent: a second call in the
    /// same process (tests) leaves the first subscriber in place.
    pub fn init(config: &ObservabilityConfig, node_id: &str) -> Result<Telemetry> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

        let otlp_endpoint = if config.tracing_enabled {
            config.otlp_endpoint.clone()
        } else {
            None
        };

        match otlp_endpoint {
            Some(endpoint) => {
                let tracer = opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint.clone()),
                    )
                    .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                        KeyValue::new("service.name", "stratum"),
                        KeyValue::new("node.id", node_id.to_string()),
                    ])))
                    .install_batch(opentelemetry_sdk::runtime::Tokio)
                    .map_err(|e| Error::Internal(format!("otlp pipeline: {}", e)))?;

                let result = tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init();
                if result.is_err() {
                    tracing::debug!("subscriber already installed, keeping existing");
                }
                tracing::info!(%endpoint, "otlp span export enabled");
                Ok(Telemetry {
                    otlp_installed: true,
                })
            }
            None => {
                let result = tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init();
                if result.is_err() {
                    tracing::debug!("subscriber already installed, keeping existing");
                }
                Ok(Telemetry {
                    otlp_installed: false,
                })
            }
        }
    }

    /// Flush and tear down exporters.
    pub fn shutdown(&self) {
        if self.otlp_installed {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_without_export_is_fine() {
        let config = ObservabilityConfig::default();
        let telemetry = Telemetry::init(&config, "test-node").unwrap();
        telemetry.shutdown();
    }

    #[test]
    fn test_second_init_is_idempotent() {
        let config = ObservabilityConfig::default();
        let first = Telemetry::init(&config, "test-node").unwrap();
        let second = Telemetry::init(&config, "test-node").unwrap();
        first.shutdown();
        second.shutdown();
    }

    #[test]
    fn test_tracing_flag_without_endpoint_stays_local() {
        let config = ObservabilityConfig {
            tracing_enabled: true,
            ..Default::default()
        };
        let telemetry = Telemetry::init(&config, "test-node").unwrap();
        assert!(!telemetry.otlp_installed);
        telemetry.shutdown();
    }
}
