use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Installs the global subscriber. `RUST_LOG` picks the filter (default
/// `info`); the `tracing_json` and `tracing_noansi` features pick the
/// output format.
pub fn setup_tracing() -> Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let installed = if cfg!(feature = "tracing_json") {
        let json_subs =
            tracing_subscriber::fmt().json().with_env_filter(filter()).finish();
        tracing::subscriber::set_global_default(json_subs)
    } else {
        let fmt_subs = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_ansi(!cfg!(feature = "tracing_noansi"))
            .finish();
        tracing::subscriber::set_global_default(fmt_subs)
    };

    installed.map_err(|e| {
        Error::Config(format!("couldn't set global tracing subscriber: {}", e))
    })
}
