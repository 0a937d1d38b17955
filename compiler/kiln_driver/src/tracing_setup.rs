//! Tracing initialization for the Kiln driver.
//!
//! `KILN_LOG` selects the filter (`RUST_LOG` syntax); `RUST_LOG` is
//! honored when `KILN_LOG` is unset. With neither set, the driver reports
//! its wave planning at `info` while the graph engine stays at `warn`,
//! since per-node integration chatter drowns out the build summary.
//!
//! `KILN_LOG_STYLE=tree` switches the compact line output to a
//! hierarchical tree, which reads better for nested integrate/trace
//! activity.

use std::sync::OnceLock;

use tracing_subscriber::{prelude::*, EnvFilter, Registry};

static INIT: OnceLock<()> = OnceLock::new();

/// Wave planning visible by default; everything else on request.
const DEFAULT_FILTER: &str = "warn,kiln_driver=info";

fn env_filter() -> EnvFilter {
    ["KILN_LOG", "RUST_LOG"]
        .iter()
        .find_map(|var| EnvFilter::try_from_env(var).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = env_filter();
        match std::env::var("KILN_LOG_STYLE").as_deref() {
            Ok("tree") => Registry::default()
                .with(
                    tracing_tree::HierarchicalLayer::new(2)
                        .with_targets(true)
                        .with_writer(std::io::stderr),
                )
                .with(filter)
                .init(),
            _ => Registry::default()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_writer(std::io::stderr)
                        .compact(),
                )
                .with(filter)
                .init(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
