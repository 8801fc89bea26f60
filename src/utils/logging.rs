use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` for filter directives, defaulting to info for this
/// crate. Also installs color_eyre so panics and error reports carry
/// context. Calling this twice is a no-op so tests can initialize freely.
pub fn init_logging() {
    let _ = color_eyre::install();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(Level::INFO.into())
            .parse("compute_orchestrator=info")
            .expect("Invalid filter directive")
    });

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}
