// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own tuning variables in
// `db::pool::PoolConfig`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "notesync_local_development_jwt_secret_must_be_32_chars";
const DEFAULT_PORT: u16 = 1234;
const DEFAULT_STORE_DEBOUNCE_MS: u64 = 2_000;
const MIN_STORE_DEBOUNCE_MS: u64 = 100;
const MAX_STORE_DEBOUNCE_MS: u64 = 60_000;
const DEFAULT_STORE_RETRY_MS: u64 = 5_000;
const MIN_STORE_RETRY_MS: u64 = 100;
const MAX_STORE_RETRY_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Shared HS256 secret used to verify connection credentials.
    pub jwt_secret: String,
    /// PostgreSQL connection string. The server binary refuses to start without it.
    pub database_url: Option<String>,
    /// Apply the bundled schema migrations at startup.
    pub run_migrations: bool,
    /// Root directory of the durable state store. Without it state lives in memory.
    pub state_dir: Option<PathBuf>,
    /// How often dirty sessions are flushed to the durable state store.
    pub store_debounce: Duration,
    /// Delay between retries of a failed final store on an idle session.
    pub store_retry: Duration,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `notesync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `NOTESYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `NOTESYNC_RELAY_PORT` | `1234` |
    /// | `NOTESYNC_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `NOTESYNC_RELAY_DATABASE_URL` | *(none, required by the binary)* |
    /// | `NOTESYNC_RELAY_RUN_MIGRATIONS` | `false` |
    /// | `NOTESYNC_RELAY_STATE_DIR` | *(none, in-memory state)* |
    /// | `NOTESYNC_RELAY_STORE_DEBOUNCE_MS` | `2000` |
    /// | `NOTESYNC_RELAY_STORE_RETRY_MS` | `5000` |
    /// | `NOTESYNC_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `NOTESYNC_RELAY_LOG_FILTER` | `info` |
    /// | `NOTESYNC_RELAY_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("NOTESYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("NOTESYNC_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("NOTESYNC_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("NOTESYNC_RELAY_DATABASE_URL").ok().filter(|v| !v.is_empty());
        let run_migrations = env("NOTESYNC_RELAY_RUN_MIGRATIONS")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let state_dir =
            env("NOTESYNC_RELAY_STATE_DIR").ok().filter(|v| !v.is_empty()).map(PathBuf::from);

        let store_debounce = millis_in_range(
            env("NOTESYNC_RELAY_STORE_DEBOUNCE_MS").ok(),
            DEFAULT_STORE_DEBOUNCE_MS,
            MIN_STORE_DEBOUNCE_MS,
            MAX_STORE_DEBOUNCE_MS,
        );
        let store_retry = millis_in_range(
            env("NOTESYNC_RELAY_STORE_RETRY_MS").ok(),
            DEFAULT_STORE_RETRY_MS,
            MIN_STORE_RETRY_MS,
            MAX_STORE_RETRY_MS,
        );

        let cors_origins = env("NOTESYNC_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("NOTESYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("NOTESYNC_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            run_migrations,
            state_dir,
            store_debounce,
            store_retry,
            cors_origins,
            log_filter,
            log_format,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn millis_in_range(raw: Option<String>, default: u64, min: u64, max: u64) -> Duration {
    let millis = raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(default);
    Duration::from_millis(millis.clamp(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 1234);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert!(!cfg.run_migrations);
        assert!(cfg.state_dir.is_none());
        assert_eq!(cfg.store_debounce, Duration::from_millis(2_000));
        assert_eq!(cfg.store_retry, Duration::from_millis(5_000));
        assert!(cfg.cors_origins.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("NOTESYNC_RELAY_HOST", "127.0.0.1");
        m.insert("NOTESYNC_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("NOTESYNC_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 1234);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("NOTESYNC_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn storage_backends_from_env() {
        let mut m = HashMap::new();
        m.insert("NOTESYNC_RELAY_DATABASE_URL", "postgres://u:p@host/db");
        m.insert("NOTESYNC_RELAY_RUN_MIGRATIONS", "true");
        m.insert("NOTESYNC_RELAY_STATE_DIR", "/var/lib/notesync");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db"));
        assert!(cfg.run_migrations);
        assert_eq!(cfg.state_dir, Some(PathBuf::from("/var/lib/notesync")));
    }

    #[test]
    fn empty_database_url_is_ignored() {
        let mut m = HashMap::new();
        m.insert("NOTESYNC_RELAY_DATABASE_URL", "");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn store_intervals_are_clamped() {
        let mut m = HashMap::new();
        m.insert("NOTESYNC_RELAY_STORE_DEBOUNCE_MS", "5");
        m.insert("NOTESYNC_RELAY_STORE_RETRY_MS", "999999999");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.store_debounce, Duration::from_millis(100));
        assert_eq!(cfg.store_retry, Duration::from_millis(300_000));
    }

    #[test]
    fn json_log_format_override() {
        let mut m = HashMap::new();
        m.insert("NOTESYNC_RELAY_LOG_FORMAT", "json");
        m.insert("NOTESYNC_RELAY_LOG_FILTER", "debug,tower_http=trace");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }
}
