// clinical-chat/crates/clinical-chat/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset or unparseable: engine events at
/// info, the HTTP stack only when something goes wrong.
pub const DEFAULT_FILTER: &str = "clinical_chat=info,reqwest=warn,hyper=warn,warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global fmt subscriber. Logs go to stderr; stdout carries the
/// streamed replies in the CLI. A second call is a no-op.
pub fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::debug!("Tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let filter = EnvFilter::try_new(DEFAULT_FILTER).unwrap();
        assert!(filter.to_string().contains("clinical_chat=info"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
