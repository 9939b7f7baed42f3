//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use dav_core::{DavError, DavResult};

use crate::LogConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Fails if a global subscriber
/// was already installed.
pub fn init_tracing(config: &LogConfig) -> DavResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DavError::InvalidConfig(format!("log level {}: {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| DavError::InvalidConfig(format!("tracing already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig {
            level: "dav_runtime=debug".into(),
            json: true,
        };
        // Another test may have installed one already
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(DavError::InvalidConfig(_))));
    }
}
