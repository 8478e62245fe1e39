//! Log output for the searchgate binary.
//!
//! `RUST_LOG` wins when it is set. Otherwise the configured level applies to
//! the searchgate crates only, and everything else (the kube and sqlx client
//! stacks in particular) is held at `warn`:
//!
//! ```text
//! warn,searchgate=info,searchgate_server=info,searchgate_domain=info,searchgate_storage=info
//! ```
//!
//! With `logging.json` set, each event is one JSON object per line with its
//! fields nested under `fields` and the enclosing span under `span`.

use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;

/// Targets that follow the configured level.
const SEARCHGATE_TARGETS: [&str; 4] = [
    "searchgate",
    "searchgate_server",
    "searchgate_domain",
    "searchgate_storage",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub json: bool,
    pub level: Level,
}

impl From<&LoggingSettings> for LoggingConfig {
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            json: settings.json,
            level: settings.level.parse().unwrap_or(Level::INFO),
        }
    }
}

impl LoggingConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = vec!["warn".to_string()];
        directives.extend(SEARCHGATE_TARGETS.iter().map(|target| format!("{target}={level}")));
        directives.join(",")
    }
}

fn subscriber<W>(config: &LoggingConfig, filter: EnvFilter, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        Box::new(
            registry.with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(writer),
            ),
        )
    } else {
        Box::new(registry.with(fmt::layer().with_writer(writer)))
    }
}

/// Installs the global subscriber writing to stdout. Later calls have no effect.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));
    if tracing::subscriber::set_global_default(subscriber(config, filter, std::io::stdout)).is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
