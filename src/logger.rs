use anyhow::Result;
use std::io;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    EnvFilter,
};

static INIT: Once = Once::new();

/// Initialize the logging system. Later calls are no-ops.
pub fn init_logger(log_level: &str) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };

        let env_filter = EnvFilter::from_default_env().add_directive(level.into());

        let terminal_layer = fmt::layer()
            .with_writer(io::stdout)
            .with_span_events(FmtSpan::CLOSE)
            .with_line_number(true)
            .with_target(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(terminal_layer);

        result = tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow::anyhow!("Failed to set global tracing subscriber: {}", e));

        if result.is_ok() {
            tracing::info!("Logging system initialized at {}", level);
        }
    });

    result
}
