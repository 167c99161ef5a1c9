use std::env;

use crate::error::FatalConfig;

/// Server configuration. All values read from environment variables with
/// sensible defaults; the two hard requirements are checked in `from_env`.
///
/// Environment variables:
/// - `DATABASE_URL` — required, Postgres DSN
/// - `BUS_URL` — optional; absent means standalone (single-instance) mode
/// - `FRONTEND_ORIGIN` — comma-separated CORS allowlist
/// - `COOKIE_SECRET` — salt for IP hashing; required when `MUSICR_ENV=production`
/// - `HEARTBEAT_TIMEOUT_MS` — close idle sockets after this (default: 45000)
/// - `RATE_LIMIT` — messages per window as "max/window_secs" (default: 10/10)
/// - `MAINTENANCE_MODE` — refuse upgrades and message frames when true
/// - `DEBUG_MATCHING` — log one line per match with its fingerprint
/// - `EMBED_REMOTE_URL` — optional remote embedding endpoint (fallback path)
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bus_url: Option<String>,
    pub frontend_origins: Vec<String>,
    pub cookie_secret: String,
    pub heartbeat_timeout_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub maintenance_mode: bool,
    pub debug_matching: bool,
    pub embed_remote_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            bus_url: None,
            frontend_origins: vec![],
            cookie_secret: "dev-secret".to_string(),
            heartbeat_timeout_ms: 45_000,
            rate_limit_max: 10,
            rate_limit_window_secs: 10,
            maintenance_mode: false,
            debug_matching: false,
            embed_remote_url: None,
        }
    }
}

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, FatalConfig> {
        let mut config = Self::default();

        config.database_url =
            env::var("DATABASE_URL").map_err(|_| FatalConfig::MissingEnv("DATABASE_URL"))?;

        config.bus_url = env::var("BUS_URL").ok().filter(|v| !v.trim().is_empty());

        if let Ok(origins) = env::var("FRONTEND_ORIGIN") {
            config.frontend_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        let production = env::var("MUSICR_ENV")
            .map(|v| v.to_lowercase() == "production")
            .unwrap_or(false);
        match env::var("COOKIE_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => config.cookie_secret = secret,
            _ if production => return Err(FatalConfig::MissingEnv("COOKIE_SECRET")),
            _ => {}
        }

        if let Ok(val) = env::var("HEARTBEAT_TIMEOUT_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.heartbeat_timeout_ms = n;
        }

        if let Ok(val) = env::var("RATE_LIMIT") {
            let (max, window) = parse_rate_limit(&val)
                .ok_or_else(|| FatalConfig::Invalid("RATE_LIMIT", val.clone()))?;
            config.rate_limit_max = max;
            config.rate_limit_window_secs = window;
        }

        config.maintenance_mode = env_bool("MAINTENANCE_MODE");
        config.debug_matching = env_bool("DEBUG_MATCHING");
        config.embed_remote_url = env::var("EMBED_REMOTE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(config)
    }

    pub fn heartbeat_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Parse "10/10" into (max, window_secs).
fn parse_rate_limit(val: &str) -> Option<(u32, u64)> {
    let (max, window) = val.split_once('/')?;
    let max = max.trim().parse().ok()?;
    let window = window.trim().parse().ok()?;
    if max == 0 || window == 0 {
        return None;
    }
    Some((max, window))
}

/// Process-scoped instance identifier, e.g. "myhost-3fa9c1d2".
/// Included in every response and bus envelope to diagnose split-brain.
pub fn generate_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rate_limit_pairs() {
        assert_eq!(parse_rate_limit("10/10"), Some((10, 10)));
        assert_eq!(parse_rate_limit(" 25 / 60 "), Some((25, 60)));
        assert_eq!(parse_rate_limit("10"), None);
        assert_eq!(parse_rate_limit("0/10"), None);
        assert_eq!(parse_rate_limit("ten/10"), None);
    }

    #[test]
    fn instance_ids_are_unique() {
        let a = generate_instance_id();
        let b = generate_instance_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }
}
