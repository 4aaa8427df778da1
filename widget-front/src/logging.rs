use anyhow::{anyhow, Result};
use livecell_base::LOG_FORMAT_JSON;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: `RUST_LOG` filter (default `info`), JSON
/// lines when `LOG_FORMAT=json`.
pub fn tracing_init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if *LOG_FORMAT_JSON {
        builder.json().try_init().map_err(|e| anyhow!(e))
    } else {
        builder.try_init().map_err(|e| anyhow!(e))
    }
}
