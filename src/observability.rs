//! Tracing init. Call once at process startup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing. `--verbose` raises the level to debug, `--quiet`
/// lowers it to warn. The `BUNS_LOG` environment variable overrides both.
pub fn init_tracing(verbose: bool, quiet: bool) {
    let default = if quiet {
        "buns=warn"
    } else if verbose {
        "buns=debug"
    } else {
        "buns=info"
    };

    let filter = EnvFilter::try_from_env("BUNS_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .try_init();
}
