// =============================================================================
// Configuration — environment-driven engine settings
// =============================================================================
//
// Everything tunable lives here. Required values fail fast at startup;
// tunables carry defaults so a bare `.env` with exchange credentials and a
// reachable store is enough to boot.
// =============================================================================

use anyhow::{Context, Result};
use tracing::warn;

// =============================================================================
// Defaults
// =============================================================================

const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
const DEFAULT_SERVER_PORT: u16 = 8080;
const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_KEY_PREFIX: &str = "tuyul";
const DEFAULT_API_URL: &str = "https://indodax.com";
const DEFAULT_WS_URL: &str = "wss://ws3.indodax.com/ws/";
const DEFAULT_PRIVATE_WS_URL: &str = "wss://pws.indodax.com/ws/";

/// Seconds between REST summary polls (bid/ask refresh).
const DEFAULT_GAP_POLL_SECS: u64 = 60;
/// Seconds between timeframe reset sweeps.
const DEFAULT_TIMEFRAME_SWEEP_SECS: u64 = 10;
/// Seconds between order-monitor polls per user.
const DEFAULT_ORDER_POLL_SECS: u64 = 5;
/// Seconds between pump-hunter exit evaluations.
const DEFAULT_EXIT_CHECK_SECS: u64 = 10;
/// Seconds the pump-hunter buffers entry signals before processing.
const DEFAULT_SIGNAL_WINDOW_SECS: u64 = 1;
/// Seconds before a paper order fills.
const DEFAULT_PAPER_FILL_SECS: u64 = 5;

// =============================================================================
// Config
// =============================================================================

/// Immutable engine configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub server_host: String,
    pub server_port: u16,
    /// Deployment environment tag ("development", "production", ...).
    pub server_env: String,
    pub cors_allowed_origins: Vec<String>,

    // ── KV store ────────────────────────────────────────────────────────
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    /// Prefix prepended to every key this engine writes.
    pub key_prefix: String,

    // ── Credential vault ────────────────────────────────────────────────
    /// 32-byte AES-256-GCM key, hex or raw.
    pub encryption_key: [u8; 32],

    // ── Exchange ────────────────────────────────────────────────────────
    pub exchange_api_url: String,
    pub exchange_ws_url: String,
    pub exchange_private_ws_url: String,
    /// Connection token for the public WebSocket.
    pub exchange_ws_token: String,

    // ── Engine tunables ─────────────────────────────────────────────────
    pub gap_poll_secs: u64,
    pub timeframe_sweep_secs: u64,
    pub order_poll_secs: u64,
    pub exit_check_secs: u64,
    pub signal_window_secs: u64,
    pub paper_fill_secs: u64,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
    pub log_json: bool,
}

impl Config {
    /// Load configuration from the environment. Returns an error on missing
    /// or malformed required values; the process should exit non-zero.
    pub fn from_env() -> Result<Self> {
        let encryption_key = parse_encryption_key(
            &std::env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY is required")?,
        )?;

        let exchange_ws_token = std::env::var("INDODAX_WS_TOKEN").unwrap_or_default();
        if exchange_ws_token.is_empty() {
            warn!("INDODAX_WS_TOKEN is not set — public WebSocket auth will fail");
        }

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            server_host: env_or("SERVER_HOST", DEFAULT_SERVER_HOST),
            server_port: env_parse("SERVER_PORT", DEFAULT_SERVER_PORT)?,
            server_env: env_or("SERVER_ENV", "development"),
            cors_allowed_origins,

            redis_host: env_or("REDIS_HOST", DEFAULT_REDIS_HOST),
            redis_port: env_parse("REDIS_PORT", DEFAULT_REDIS_PORT)?,
            redis_password: std::env::var("REDIS_PASSWORD").ok().filter(|s| !s.is_empty()),
            redis_db: env_parse("REDIS_DB", 0)?,
            key_prefix: env_or("REDIS_PREFIX", DEFAULT_KEY_PREFIX),

            encryption_key,

            exchange_api_url: env_or("INDODAX_API_URL", DEFAULT_API_URL),
            exchange_ws_url: env_or("INDODAX_WS_URL", DEFAULT_WS_URL),
            exchange_private_ws_url: env_or("INDODAX_PRIVATE_WS_URL", DEFAULT_PRIVATE_WS_URL),
            exchange_ws_token,

            gap_poll_secs: env_parse("GAP_POLL_SECS", DEFAULT_GAP_POLL_SECS)?,
            timeframe_sweep_secs: env_parse("TIMEFRAME_SWEEP_SECS", DEFAULT_TIMEFRAME_SWEEP_SECS)?,
            order_poll_secs: env_parse("ORDER_POLL_SECS", DEFAULT_ORDER_POLL_SECS)?,
            exit_check_secs: env_parse("EXIT_CHECK_SECS", DEFAULT_EXIT_CHECK_SECS)?,
            signal_window_secs: env_parse("SIGNAL_WINDOW_SECS", DEFAULT_SIGNAL_WINDOW_SECS)?,
            paper_fill_secs: env_parse("PAPER_FILL_SECS", DEFAULT_PAPER_FILL_SECS)?,

            log_level: env_or("LOG_LEVEL", "info"),
            log_json: env_or("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
        })
    }

    /// Redis connection URL assembled from host/port/password/db.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(pw) => format!(
                "redis://:{}@{}:{}/{}",
                pw, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }

    /// Socket address the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        _ => Ok(default),
    }
}

/// Accepts either a 64-char hex string or a raw 32-byte string.
fn parse_encryption_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = if raw.len() == 64 {
        hex::decode(raw).context("ENCRYPTION_KEY is not valid hex")?
    } else {
        raw.as_bytes().to_vec()
    };

    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("ENCRYPTION_KEY must be exactly 32 bytes"))?;
    Ok(arr)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_key_raw_32_bytes() {
        let key = parse_encryption_key("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(&key[..4], b"0123");
    }

    #[test]
    fn encryption_key_hex_64_chars() {
        let hex_key = "aa".repeat(32);
        let key = parse_encryption_key(&hex_key).unwrap();
        assert_eq!(key, [0xaa; 32]);
    }

    #[test]
    fn encryption_key_wrong_length_rejected() {
        assert!(parse_encryption_key("too short").is_err());
        assert!(parse_encryption_key(&"a".repeat(33)).is_err());
    }
}
