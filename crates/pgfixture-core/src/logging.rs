use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `PGFIXTURE_LOG` (default `info`).
///
/// Output goes through the test writer so it is captured per test. Calling
/// this more than once, or after another subscriber was installed, does
/// nothing.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PGFIXTURE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .without_time()
        .with_test_writer()
        .try_init();
}
