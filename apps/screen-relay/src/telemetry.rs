use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "screen-relay";
const OTEL_STDOUT_ENV: &str = "SCREEN_RELAY_OTEL_STDOUT";

pub const METRIC_CONNECTIONS: &str = "screen_relay_connections_total";
pub const METRIC_REGISTRATIONS: &str = "screen_relay_registrations_total";
pub const METRIC_MESSAGES: &str = "screen_relay_messages_total";
pub const METRIC_BYTES_RELAYED: &str = "screen_relay_bytes_relayed_total";
pub const METRIC_FLOW_CONTROL_DROPS: &str = "screen_relay_flow_control_drops_total";
pub const METRIC_OUTBOX_LAGGED: &str = "screen_relay_outbox_lagged_total";
pub const METRIC_IDLE_EVICTIONS: &str = "screen_relay_idle_evictions_total";
pub const METRIC_PROTOCOL_ERRORS: &str = "screen_relay_protocol_errors_total";
pub const METRIC_POLL_ERRORS: &str = "screen_relay_poll_errors_total";
pub const METRIC_HOSTS_ACTIVE: &str = "screen_relay_hosts_active";
pub const METRIC_VIEWERS_ACTIVE: &str = "screen_relay_viewers_active";

/// Process-wide logging, tracing and metrics. Keep alive for the lifetime of
/// the server; dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_relay_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);

        let registry = tracing_subscriber::registry()
            .with(default_filter())
            .with(tracing_subscriber::fmt::layer().with_target(false));

        match &tracer_provider {
            Some(provider) => {
                global::set_tracer_provider(provider.clone());
                let tracer = provider.tracer(SERVICE_NAME);
                registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init()
                    .context("failed to initialise tracing subscriber")?;
                info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
            }
            None => registry
                .try_init()
                .context("failed to initialise tracing subscriber")?,
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(
                    error = %err,
                    "failed to shutdown OpenTelemetry tracer provider"
                );
            }
        }
    }
}

/// Register help text for every series the relay emits. All are labelled by
/// `channel` (`main` or `pointer`).
fn describe_relay_metrics() {
    describe_counter!(
        METRIC_CONNECTIONS,
        "Push sockets accepted plus poll registrations"
    );
    describe_counter!(
        METRIC_REGISTRATIONS,
        "Host and viewer registrations, labelled by role"
    );
    describe_counter!(
        METRIC_MESSAGES,
        "Relay attempts by outcome (delivered, unregistered, forbidden, no_peer, dropped)"
    );
    describe_counter!(
        METRIC_BYTES_RELAYED,
        Unit::Bytes,
        "Media payload bytes delivered to a peer"
    );
    describe_counter!(
        METRIC_FLOW_CONTROL_DROPS,
        "Frames rejected because the receiver's frame lane was full"
    );
    describe_counter!(
        METRIC_OUTBOX_LAGGED,
        "Pointer frames discarded in favour of newer ones"
    );
    describe_counter!(
        METRIC_IDLE_EVICTIONS,
        "Slots reclaimed by the liveness sweep, labelled by role"
    );
    describe_counter!(
        METRIC_PROTOCOL_ERRORS,
        "WebSocket frames rejected as malformed, unknown or missing a session id"
    );
    describe_counter!(METRIC_POLL_ERRORS, "Poll requests answered with an error");
    describe_gauge!(METRIC_HOSTS_ACTIVE, "Occupied host slots");
    describe_gauge!(METRIC_VIEWERS_ACTIVE, "Occupied viewer slots");
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| {
            matches!(
                val.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}
