//! Configuration module for the fleet sync engine.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::DEFAULT_MAX_SYNC_ATTEMPTS;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key for the local API (required in production)
    pub api_psk: Option<String>,
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Address to bind the local API to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of text
    pub log_json: bool,
    /// Base URL of the hosted cloud store. Unset keeps the cloud in memory.
    pub cloud_url: Option<String>,
    /// Bearer token for the hosted cloud store
    pub cloud_token: Option<String>,
    /// Time between background sync passes
    pub sync_interval: Duration,
    /// Attempts after which a record is reported as failed
    pub sync_max_attempts: i64,
    /// Lifetime of an invite code
    pub invite_ttl: chrono::Duration,
}

/// Longest invite lifetime accepted from the environment.
const MAX_INVITE_TTL_MINUTES: i64 = 7 * 24 * 60;

fn invite_ttl_from_minutes(minutes: i64) -> chrono::Duration {
    chrono::Duration::minutes(minutes.clamp(1, MAX_INVITE_TTL_MINUTES))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let api_psk = env::var("FLEET_API_PSK").ok();

        let db_path = env::var("FLEET_DB_PATH")
            .unwrap_or_else(|_| "./data/fleet.sqlite".to_string())
            .into();

        let bind_addr = parse_or(
            "FLEET_BIND_ADDR",
            SocketAddr::from(([127, 0, 0, 1], 8787)),
        );

        let log_level = env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let log_json = env::var("FLEET_LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let cloud_url = env::var("FLEET_CLOUD_URL").ok().filter(|u| !u.is_empty());
        let cloud_token = env::var("FLEET_CLOUD_TOKEN").ok();

        let sync_interval = Duration::from_secs(parse_or("FLEET_SYNC_INTERVAL_SECS", 900u64).max(1));
        let sync_max_attempts =
            parse_or("FLEET_SYNC_MAX_ATTEMPTS", DEFAULT_MAX_SYNC_ATTEMPTS).max(1);
        let invite_ttl = invite_ttl_from_minutes(parse_or("FLEET_INVITE_TTL_MINUTES", 30i64));

        Self {
            api_psk,
            db_path,
            bind_addr,
            log_level,
            log_json,
            cloud_url,
            cloud_token,
            sync_interval,
            sync_max_attempts,
            invite_ttl,
        }
    }
}
