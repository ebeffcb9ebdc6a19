/// Server configuration loaded from environment variables.
///
/// Every field has a default suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    /// Empty allows any origin.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `120`). Uploads of large
    /// bundles go through the same timeout.
    pub request_timeout_secs: u64,
    /// Largest accepted upload in megabytes (default: `512`).
    pub max_upload_mb: usize,
    /// How long to wait for the worker pool to stop (default: `30`).
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("{name} must be {expected}, got {value:?}")]
pub struct ConfigError {
    pub name: &'static str,
    pub expected: &'static str,
    pub value: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            cors_origins: Vec::new(),
            request_timeout_secs: 120,
            max_upload_mb: 512,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default   |
    /// |-------------------------|-----------|
    /// | `HOST`                  | `0.0.0.0` |
    /// | `PORT`                  | `8000`    |
    /// | `CORS_ORIGINS`          | (any)     |
    /// | `REQUEST_TIMEOUT_SECS`  | `120`     |
    /// | `MAX_UPLOAD_MB`         | `512`     |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`      |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = std::env::var("HOST").unwrap_or(defaults.host);

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let max_upload_mb = parse("MAX_UPLOAD_MB", "a positive integer", defaults.max_upload_mb)?;
        if max_upload_mb == 0 {
            return Err(ConfigError {
                name: "MAX_UPLOAD_MB",
                expected: "a positive integer",
                value: "0".into(),
            });
        }

        Ok(Self {
            host,
            port: parse("PORT", "a valid port", defaults.port)?,
            cors_origins,
            request_timeout_secs: parse(
                "REQUEST_TIMEOUT_SECS",
                "a number of seconds",
                defaults.request_timeout_secs,
            )?,
            max_upload_mb,
            shutdown_timeout_secs: parse(
                "SHUTDOWN_TIMEOUT_SECS",
                "a number of seconds",
                defaults.shutdown_timeout_secs,
            )?,
        })
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

fn parse<T: std::str::FromStr>(
    name: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| ConfigError {
            name,
            expected,
            value: raw,
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_limit_is_in_bytes() {
        let config = ServerConfig {
            max_upload_mb: 2,
            ..ServerConfig::default()
        };
        assert_eq!(config.max_upload_bytes(), 2 * 1024 * 1024);
    }
}
