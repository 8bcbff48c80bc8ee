use tracing_subscriber::{fmt, EnvFilter};

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, or `default_filter`
/// when the variable is unset. Safe to call more than once; later calls
/// are ignored.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing("info,delegation=debug");
        init_tracing("warn");
        tracing::info!(target: "delegation::router", "still logging");
    }
}
