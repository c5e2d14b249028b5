use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber. `RUST_LOG` wins over `verbosity`
/// (0 = info, 1 = debug, 2+ = trace). Safe to call more than once.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("lease={level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
