//! Runtime configuration from the process environment.
//! An optional `.env` file is merged into the environment by `main` before this runs.

use crate::client::DEFAULT_BASE_URL;
use std::time::Duration;
use std::{fs, path::Path};

pub const DEFAULT_POLL_SECS: u64 = 10;
pub const DEFAULT_PENDING_WRITE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
pub const TOKEN_FILE: &str = "token.txt";

#[derive(Debug, Clone)]
pub struct Config {
    pub email: Option<String>,
    pub password: Option<String>,
    /// Session token; read from `COSA_TOKEN` or `token.txt`.
    pub token: Option<String>,
    /// Thermostat to control. When unset, the first endpoint on the account is used.
    pub endpoint_id: Option<String>,
    /// Place used for the outdoor forecast; forecast is skipped when unset.
    pub place_id: Option<String>,
    pub api_base_url: String,
    pub poll_interval: Duration,
    /// How long an unconfirmed write may shadow polled values.
    pub pending_write_timeout: Duration,
    pub api_timeout: Duration,
    pub reports_enabled: bool,
    pub simulate: bool,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn flag(v: Option<String>, default: bool) -> bool {
    v.map(|s| matches!(s.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

fn seconds(v: Option<String>, default: u64) -> u64 {
    v.and_then(|s| s.trim().parse::<u64>().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok(), Path::new(TOKEN_FILE))
    }

    /// Build a config from any key lookup; `token_file` is consulted when no token is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, token_file: &Path) -> Result<Self, String> {
        let simulate = flag(lookup("SIMULATE"), false);
        let email = non_empty(lookup("COSA_EMAIL"));
        let password = non_empty(lookup("COSA_PASSWORD"));

        // Prefer env var; fallback to token.txt in working directory
        let token = non_empty(lookup("COSA_TOKEN")).or_else(|| non_empty(fs::read_to_string(token_file).ok()));

        if !simulate && token.is_none() && (email.is_none() || password.is_none()) {
            return Err(format!(
                "Missing credentials: set COSA_EMAIL and COSA_PASSWORD, or COSA_TOKEN (or provide {})",
                token_file.display()
            ));
        }

        let poll_secs = seconds(lookup("POLL_INTERVAL_SECS"), DEFAULT_POLL_SECS);
        if poll_secs == 0 {
            return Err("POLL_INTERVAL_SECS must be at least 1".to_string());
        }
        let api_timeout_secs = seconds(lookup("API_TIMEOUT_SECS"), DEFAULT_API_TIMEOUT_SECS);
        if api_timeout_secs == 0 {
            return Err("API_TIMEOUT_SECS must be at least 1".to_string());
        }

        Ok(Config {
            email,
            password,
            token,
            endpoint_id: non_empty(lookup("COSA_ENDPOINT_ID")),
            place_id: non_empty(lookup("COSA_PLACE_ID")),
            api_base_url: non_empty(lookup("COSA_API_BASE_URL")).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            poll_interval: Duration::from_secs(poll_secs),
            pending_write_timeout: Duration::from_secs(seconds(
                lookup("PENDING_WRITE_TIMEOUT_SECS"),
                DEFAULT_PENDING_WRITE_TIMEOUT_SECS,
            )),
            api_timeout: Duration::from_secs(api_timeout_secs),
            reports_enabled: flag(lookup("REPORTS_ENABLED"), true),
            simulate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key: &str| map.get(key).map(|v| v.to_string())
    }

    fn no_token_file() -> &'static Path {
        Path::new("tests/data/does-not-exist.txt")
    }

    #[test]
    fn defaults_with_credentials() {
        let cfg = Config::from_lookup(
            lookup(&[("COSA_EMAIL", "me@example.com"), ("COSA_PASSWORD", "hunter2")]),
            no_token_file(),
        )
        .unwrap();
        assert_eq!(cfg.email.as_deref(), Some("me@example.com"));
        assert_eq!(cfg.token, None);
        assert_eq!(cfg.api_base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.pending_write_timeout, Duration::from_secs(30));
        assert_eq!(cfg.api_timeout, Duration::from_secs(30));
        assert!(cfg.reports_enabled);
        assert!(!cfg.simulate);
        assert_eq!(cfg.endpoint_id, None);
    }

    #[test]
    fn overrides_are_read() {
        let cfg = Config::from_lookup(
            lookup(&[
                ("COSA_TOKEN", "  abc123 "),
                ("COSA_ENDPOINT_ID", "66e06d3edac55e12009be544"),
                ("COSA_PLACE_ID", "p1"),
                ("POLL_INTERVAL_SECS", "15"),
                ("PENDING_WRITE_TIMEOUT_SECS", "45"),
                ("REPORTS_ENABLED", "false"),
                ("COSA_API_BASE_URL", "http://localhost:8080"),
            ]),
            no_token_file(),
        )
        .unwrap();
        assert_eq!(cfg.token.as_deref(), Some("abc123"));
        assert_eq!(cfg.endpoint_id.as_deref(), Some("66e06d3edac55e12009be544"));
        assert_eq!(cfg.place_id.as_deref(), Some("p1"));
        assert_eq!(cfg.poll_interval, Duration::from_secs(15));
        assert_eq!(cfg.pending_write_timeout, Duration::from_secs(45));
        assert!(!cfg.reports_enabled);
        assert_eq!(cfg.api_base_url, "http://localhost:8080");
    }

    #[test]
    fn missing_credentials_is_an_error_unless_simulating() {
        let err = Config::from_lookup(lookup(&[("COSA_EMAIL", "me@example.com")]), no_token_file()).unwrap_err();
        assert!(err.contains("COSA_PASSWORD"), "{err}");

        let cfg = Config::from_lookup(lookup(&[("SIMULATE", "1")]), no_token_file()).unwrap();
        assert!(cfg.simulate);
    }

    #[test]
    fn token_file_fallback() {
        let dir = std::env::temp_dir().join(format!("cosa-sync-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token.txt");
        fs::write(&path, "from-file\n").unwrap();

        let cfg = Config::from_lookup(lookup(&[]), &path).unwrap();
        assert_eq!(cfg.token.as_deref(), Some("from-file"));

        let cfg = Config::from_lookup(lookup(&[("COSA_TOKEN", "from-env")]), &path).unwrap();
        assert_eq!(cfg.token.as_deref(), Some("from-env"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn zero_interval_rejected() {
        let err = Config::from_lookup(lookup(&[("SIMULATE", "true"), ("POLL_INTERVAL_SECS", "0")]), no_token_file())
            .unwrap_err();
        assert!(err.contains("POLL_INTERVAL_SECS"));
    }
}
