use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SCANNER_WS_PORT", default_value = "8765")]
    pub port: u16,

    #[clap(long, env = "SCANNER_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SCANNER_LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    #[clap(long, env = "SCANNER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[clap(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    #[clap(long, env = "REDIS_PORT", default_value = "6379")]
    pub redis_port: u16,

    #[clap(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// When disabled the gateway accepts anonymous connections and skips
    /// every scan-ownership check.
    #[clap(long, env = "SCANNER_AUTH_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    pub auth_enabled: bool,

    #[clap(long, env = "SCANNER_JWKS_URL")]
    pub jwks_url: Option<String>,

    #[clap(long, env = "SCANNER_JWKS_REFRESH_SECS", default_value = "600")]
    pub jwks_refresh_secs: u64,

    /// Base URL of the upstream market-data connector (its /subscriptions
    /// endpoint feeds the periodic status broadcast).
    #[clap(long, env = "SCANNER_CONNECTOR_URL", default_value = "http://127.0.0.1:8090")]
    pub connector_url: String,

    /// Per-symbol aggregate throttle window.
    #[clap(long, env = "SCANNER_THROTTLE_MS", default_value = "1000")]
    pub throttle_ms: u64,

    /// Sampler flush cadence.
    #[clap(long, env = "SCANNER_FLUSH_MS", default_value = "500")]
    pub flush_ms: u64,

    /// Coalescing buffer capacity; aggregates for new symbols are dropped
    /// beyond this.
    #[clap(long, env = "SCANNER_SAMPLER_CAPACITY", default_value = "10000")]
    pub sampler_capacity: usize,

    /// Per-connection outbound queue bound; overflow closes the socket.
    #[clap(long, env = "SCANNER_OUTBOUND_QUEUE", default_value = "512")]
    pub outbound_queue: usize,

    #[clap(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,
}

pub fn load_config() -> Config {
    let cli_config = Config::parse();

    let config_from_file = cli_config.config_path.as_ref().and_then(|path| {
        fs::read_to_string(path)
            .ok()
            .and_then(|c| serde_json::from_str::<Config>(&c).ok())
    });

    if let Some(file_config) = config_from_file {
        // Command-line arguments override file configuration
        Config {
            port: cli_config.port,
            config_path: cli_config.config_path.or(file_config.config_path),
            log_dir: cli_config.log_dir,
            log_level: cli_config.log_level,
            redis_host: cli_config.redis_host,
            redis_port: cli_config.redis_port,
            redis_password: cli_config.redis_password.or(file_config.redis_password),
            auth_enabled: cli_config.auth_enabled,
            jwks_url: cli_config.jwks_url.or(file_config.jwks_url),
            jwks_refresh_secs: cli_config.jwks_refresh_secs,
            connector_url: cli_config.connector_url,
            throttle_ms: cli_config.throttle_ms,
            flush_ms: cli_config.flush_ms,
            sampler_capacity: cli_config.sampler_capacity,
            outbound_queue: cli_config.outbound_queue,
            tls_cert_path: cli_config.tls_cert_path.or(file_config.tls_cert_path),
            tls_key_path: cli_config.tls_key_path.or(file_config.tls_key_path),
        }
    } else {
        cli_config
    }
}
