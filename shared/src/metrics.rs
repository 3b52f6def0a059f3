use metrics_exporter_statsd::{StatsdBuilder, StatsdError};

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not build statsd exporter: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a global metrics recorder is already installed")]
    RecorderAlreadySet,
}

/// Installs a statsd exporter as the global `metrics` recorder.
///
/// Until this is called every `counter!`/`histogram!` emission is a no-op, which is
/// what tests and runs without a metrics section rely on.
pub fn init_statsd(host: &str, port: u16, prefix: &str) -> Result<(), MetricsError> {
    let recorder = StatsdBuilder::from(host, port)
        .with_queue_size(5000)
        .build(Some(prefix))?;

    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::RecorderAlreadySet)?;
    tracing::info!("Sending metrics to statsd at {host}:{port}");
    Ok(())
}
