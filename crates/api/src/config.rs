use std::path::PathBuf;
use std::str::FromStr;

/// Default HTTP request timeout. Covers a worker cold start followed by
/// the longest synchronous generation call.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 900;

/// Invalid value in the environment.
#[derive(Debug, thiserror::Error)]
#[error("{var} must be a valid {expected}, got '{value}'")]
pub struct ConfigError {
    pub var: &'static str,
    pub expected: &'static str,
    pub value: String,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for a single local machine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `127.0.0.1`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Directory holding every worker install, outputs and the log file.
    pub root: PathBuf,
    /// Interpreter used to create worker environments.
    pub python: String,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds. Generation calls block through the
    /// readiness wait and the whole job, so this is long.
    pub request_timeout_secs: u64,
    /// How long shutdown waits for background installs to unwind.
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                 |
    /// |------------------------|-------------------------|
    /// | `HOST`                 | `127.0.0.1`             |
    /// | `PORT`                 | `3000`                  |
    /// | `KILN_ROOT`            | `./kiln-data`           |
    /// | `PYTHON_BIN`           | `python3`               |
    /// | `CORS_ORIGINS`         | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS` | `900`                   |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `10`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let cors_origins = text("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host: text("HOST", "127.0.0.1"),
            port: parse(&lookup, "PORT", "u16", 3000)?,
            root: PathBuf::from(text("KILN_ROOT", "./kiln-data")),
            python: text("PYTHON_BIN", "python3"),
            cors_origins,
            request_timeout_secs: parse(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                "u64",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?,
            shutdown_timeout_secs: parse(&lookup, "SHUTDOWN_TIMEOUT_SECS", "u64", 10)?,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError {
            var,
            expected,
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.root, PathBuf::from("./kiln-data"));
        assert_eq!(config.python, "python3");
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(config.shutdown_timeout_secs, 10);
    }

    #[test]
    fn default_timeout_outlasts_cold_start_plus_sync_job() {
        let probe = kiln_supervisor::ProbeConfig::default();
        let readiness = (probe.interval + probe.request_timeout) * probe.max_attempts;
        let job = kiln_workers::JobConfig::default().sync_timeout;
        assert!(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS) > readiness + job);
    }

    #[test]
    fn origins_are_split_and_trimmed() {
        let config = load(&[("CORS_ORIGINS", "http://a.test, http://b.test,,")]).unwrap();
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn invalid_port_names_the_variable() {
        let err = load(&[("PORT", "eighty")]).unwrap_err();
        assert_eq!(err.var, "PORT");
        assert_eq!(err.to_string(), "PORT must be a valid u16, got 'eighty'");
    }
}
