use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    #[serde(default = "default_start_deadline")]
    pub start_deadline_secs: u64,

    #[serde(default = "default_stop_deadline")]
    pub stop_deadline_secs: u64,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Allowed exposed-port range, START-END.
    #[serde(default = "default_port_range")]
    pub port_range: String,

    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

fn default_bind_addr() -> String {
    std::env::var("WS_API_BIND").unwrap_or_else(|_| "0.0.0.0:3131".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("WS_API_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("ws").join("api").join("ws.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".ws").join("api").join("ws.db")
    }
}

fn default_watchdog_interval() -> u64 {
    env_or("WS_API_WATCHDOG_INTERVAL", 30)
}

fn default_start_deadline() -> u64 {
    env_or("WS_API_START_DEADLINE", 120)
}

fn default_stop_deadline() -> u64 {
    env_or("WS_API_STOP_DEADLINE", 60)
}

fn default_token_ttl() -> u64 {
    env_or("WS_API_TOKEN_TTL", 600) // 10 minutes
}

fn default_port_range() -> String {
    std::env::var("WS_API_PORT_RANGE").unwrap_or_else(|_| "1024-65535".to_string())
}

fn default_page_size() -> u32 {
    env_or("WS_API_PAGE_SIZE", 25)
}

fn default_max_page_size() -> u32 {
    env_or("WS_API_MAX_PAGE_SIZE", 100)
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            watchdog_interval_secs: default_watchdog_interval(),
            start_deadline_secs: default_start_deadline(),
            stop_deadline_secs: default_stop_deadline(),
            token_ttl_secs: default_token_ttl(),
            port_range: default_port_range(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
