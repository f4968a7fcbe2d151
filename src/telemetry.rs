use std::sync::OnceLock;

use anyhow::Result;
use tracing::subscriber;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber once per process.
///
/// `RUST_LOG` wins when set; otherwise `scribe=info`, raised to debug by
/// the `--verbose` flag.
pub fn init_tracing(verbose: bool) -> Result<()> {
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let default_level = if verbose { "scribe=debug" } else { "scribe=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false));

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_a_no_op() {
        init_tracing(false).unwrap();
        init_tracing(true).unwrap();
    }
}
