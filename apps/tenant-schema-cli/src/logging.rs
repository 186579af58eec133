use tenant_schema::config::LogFormat;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter for a `-v` count. `RUST_LOG` overrides it.
fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info,tenant_schema=info",
        2 => "debug,sqlx=warn,sea_orm=info",
        _ => "trace",
    }
}

/// Installs the global subscriber. Logs go to stderr so stdout stays
/// parseable in `--json` mode.
pub fn init(verbose: u8, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    if let Err(e) = installed {
        eprintln!("warning: logging already initialized: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_default_level() {
        assert_eq!(default_directive(0), "warn");
        assert!(default_directive(1).starts_with("info"));
        assert!(default_directive(2).starts_with("debug"));
        assert_eq!(default_directive(7), "trace");
    }
}
