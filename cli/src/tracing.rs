use berth_config::TracingConfig;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

pub struct Tracing;

impl Tracing {
    /// Installs the global subscriber for the CLI.
    ///
    /// Events go to stderr so they do not mix with the UI output on
    /// stdout. `RUST_LOG` overrides the configured filter, and the
    /// [`ErrorLayer`] captures span traces for error reports.
    pub fn init(config: &TracingConfig) {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| config.env_filter.clone().into());

        let stderr_layer = config.enable.then(|| {
            fmt::layer()
                .with_ansi(true)
                .with_writer(std::io::stderr)
                .compact()
        });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(ErrorLayer::default())
            .init();
    }
}
