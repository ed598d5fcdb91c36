//! Environment-level configuration consumed by the core.
//!
//! The core never writes these values; they are read once per process and
//! shared. Per-call overrides go through
//! [`OpenOptions`](crate::OpenOptions) instead.
//!
//! | Variable | Meaning |
//! |---|---|
//! | `NDIO_REQUEST_TIMEOUT` | Network fetch timeout in seconds (default 5) |
//! | `NDIO_NO_INTERNET` | Any non-empty value disables all network access |
//! | `NDIO_TEMPDIR` | Directory for materialized temporary copies |
//! | `NDIO_FORMAT_ORDER` | Comma-separated backend ids promoted to the front of the global priority order |

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

/// Process-wide configuration snapshot.
#[derive(Clone, Debug)]
pub struct Config {
    /// Timeout applied to network resource acquisition.
    pub request_timeout: Duration,
    /// When set, network origins fail with `ResourceUnavailable` instead of
    /// being fetched.
    pub no_internet: bool,
    /// Override directory for temporary materialized files.
    pub temp_dir: Option<PathBuf>,
    /// Backend ids to move to the front of the global priority order.
    pub format_order: Vec<String>,
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        let request_timeout = std::env::var("NDIO_REQUEST_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|secs| *secs > 0.0)
            .map_or(
                Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
                Duration::from_secs_f64,
            );

        let no_internet = std::env::var("NDIO_NO_INTERNET").is_ok_and(|v| !v.is_empty());

        let temp_dir = std::env::var_os("NDIO_TEMPDIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let format_order = std::env::var("NDIO_FORMAT_ORDER")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            request_timeout,
            no_internet,
            temp_dir,
            format_order,
        }
    }

    /// Process-wide snapshot, read from the environment on first access.
    pub fn get() -> &'static Config {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        CONFIG.get_or_init(Config::from_env)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            no_internet: false,
            temp_dir: None,
            format_order: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var parsing is exercised through from_env-equivalent paths on the
    // default snapshot only; mutating the process environment would race
    // with parallel tests.

    #[test]
    fn default_timeout() {
        let config = Config::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(!config.no_internet);
        assert!(config.format_order.is_empty());
    }
}
