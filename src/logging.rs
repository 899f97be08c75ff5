use anyhow::Context;

pub const LOG_FILTER_ENV: &str = "PATCHBAY_LOG";

/// Initialize the tracing subscriber for the CLI binaries.
///
/// Emits JSON lines to stderr so per-patch output on stdout stays
/// machine-readable. `PATCHBAY_LOG` selects the filter, defaulting to
/// `patchbay=info`.
pub fn init() -> anyhow::Result<()> {
    let _ = tracing_log::LogTracer::init();
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var(LOG_FILTER_ENV).unwrap_or_else(|_| "patchbay=info".into()))
        .json()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
        .context("install tracing subscriber")?;
    Ok(())
}

/// Best-effort variant for script bins and tests that may race on the
/// global subscriber.
pub fn init_quiet() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var(LOG_FILTER_ENV).unwrap_or_else(|_| "patchbay=info".into()))
        .json()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .try_init();
}
