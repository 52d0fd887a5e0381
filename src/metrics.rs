//! Metrics and tracing helpers, both behind cargo features.

#[cfg(feature = "metrics")]
pub use prometheus_metrics::{StrataMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram, MeterProvider as _},
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};

    pub static METRICS: Lazy<StrataMetrics> = Lazy::new(StrataMetrics::init);

    pub struct StrataMetrics {
        pub registry: Registry,
        pub statements_total: Counter<u64>,
        pub statement_duration: Histogram<f64>,
        pub statement_errors_total: Counter<u64>,
        pub migrations_applied_total: Counter<u64>,
        pub functions_retried_total: Counter<u64>,
    }

    impl StrataMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let exporter = opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
                .expect("failed to build prometheus exporter");
            let provider = SdkMeterProvider::builder().with_reader(exporter).build();
            let meter = provider.meter("strata");
            global::set_meter_provider(provider);

            let statements_total = meter.u64_counter("strata_statements_total")
                .with_description("Total statements executed").build();

            let statement_duration = meter.f64_histogram("strata_statement_duration_seconds")
                .with_description("Duration of statements").build();

            let statement_errors_total = meter.u64_counter("strata_statement_errors_total")
                .with_description("Statements rejected by the server").build();

            let migrations_applied_total = meter.u64_counter("strata_migrations_applied_total")
                .with_description("Forward migration scripts applied").build();

            let functions_retried_total = meter.u64_counter("strata_functions_retried_total")
                .with_description("Function files deferred to a later pass").build();

            Self {
                registry,
                statements_total,
                statement_duration,
                statement_errors_total,
                migrations_applied_total,
                functions_retried_total,
            }
        }

        pub fn record_statement(&self, elapsed: std::time::Duration) {
            self.statements_total.add(1, &[]);
            self.statement_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_statement_error(&self) {
            self.statement_errors_total.add(1, &[]);
        }

        pub fn record_migration_applied(&self) {
            self.migrations_applied_total.add(1, &[]);
        }

        pub fn record_function_retry(&self) {
            self.functions_retried_total.add(1, &[]);
        }

        /// Prometheus text exposition of everything recorded so far.
        pub fn render(&self) -> String {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
                log::warn!("failed to encode metrics: {e}");
            }
            String::from_utf8_lossy(&buffer).into_owned()
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn execute_query_span(query: &str) -> Span {
        // statements can be whole migration files
        let head: String = query.chars().take(120).collect();
        info_span!("strata.execute", db.statement = %head)
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("strata.connect")
    }

    pub fn begin_transaction_span(depth: u32) -> Span {
        info_span!("strata.begin", depth)
    }

    pub fn commit_transaction_span(depth: u32) -> Span {
        info_span!("strata.commit", depth)
    }

    pub fn rollback_transaction_span(depth: u32) -> Span {
        info_span!("strata.rollback", depth)
    }

    pub fn migration_span(kind: &'static str, filename: &str) -> Span {
        info_span!("strata.migration", kind, filename = %filename)
    }
}
