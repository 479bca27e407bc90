//! Tracing setup for controllers and test hosts.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Target used for re-emitted child stdout/stderr lines.
pub const HOST_OUTPUT_TARGET: &str = "testhost::host_output";

fn base_level(raw: Option<&str>) -> &'static str {
    match raw {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(testhost_log: Option<&str>) -> String {
    format!("testhost={level}", level = base_level(testhost_log))
}

/// Initialize tracing with TESTHOST_LOG and LOG_FORMAT support.
///
/// Logs go to stderr. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directives(
            std::env::var("TESTHOST_LOG").ok().as_deref(),
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(filter_directives(None), "testhost=info");
        assert_eq!(filter_directives(Some("debug")), "testhost=debug");
        assert_eq!(filter_directives(Some("warning")), "testhost=warn");
        assert_eq!(filter_directives(Some("loud")), "testhost=info");
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
