//! CLI arguments, environment configuration and defaults.

use clap::{Parser, ValueEnum};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: &str = ":8880";
pub const DEFAULT_UPLOAD_DIR: &str = "uploads/";
pub const DEFAULT_PUBLIC_DIR: &str = "./public";
pub const DEFAULT_MAX_UPLOAD_SIZE_MB: u64 = 300;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RATE_LIMIT_RPS: f64 = 5.0;
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 10;
pub const DEFAULT_VISITOR_TTL_SECS: u64 = 3 * 60;
pub const DEFAULT_VISITOR_SWEEP_SECS: u64 = 5 * 60;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
pub const SNIFF_LEN: usize = 512;
pub const MAX_EXTENSION_LEN: usize = 16;
pub const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "nyx-uploader", version, about = "Nyx file upload server")]
pub struct Args {
    #[arg(
        short = 'p',
        long,
        env = "APP_PORT",
        default_value = DEFAULT_PORT,
        help = "Listen address (`:8880`, `8880` or `0.0.0.0:8880`)"
    )]
    pub port: String,
    #[arg(
        long,
        env = "APP_BASE_URL",
        help = "Public base URL used in upload responses (defaults to http://localhost<port>)"
    )]
    pub base_url: Option<String>,
    #[arg(
        short = 'u',
        long,
        env = "UPLOAD_DIR",
        default_value = DEFAULT_UPLOAD_DIR,
        help = "Directory for uploaded files"
    )]
    pub upload_dir: String,
    #[arg(
        long,
        env = "PUBLIC_DIR",
        default_value = DEFAULT_PUBLIC_DIR,
        help = "Directory for static assets"
    )]
    pub public_dir: String,
    #[arg(
        long,
        env = "MAX_UPLOAD_SIZE_MB",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE_MB,
        help = "Max upload request size in MB"
    )]
    pub max_upload_size_mb: u64,
    #[arg(
        long,
        env = "READ_TIMEOUT",
        default_value_t = DEFAULT_READ_TIMEOUT_SECS,
        help = "Request body read timeout in seconds"
    )]
    pub read_timeout: u64,
    #[arg(
        long,
        env = "WRITE_TIMEOUT",
        default_value_t = DEFAULT_WRITE_TIMEOUT_SECS,
        help = "Request handling timeout in seconds"
    )]
    pub write_timeout: u64,
    #[arg(
        long,
        env = "IDLE_TIMEOUT",
        default_value_t = DEFAULT_IDLE_TIMEOUT_SECS,
        help = "Idle keep-alive timeout in seconds"
    )]
    pub idle_timeout: u64,
    #[arg(
        long,
        env = "RATE_LIMIT_RPS",
        default_value_t = DEFAULT_RATE_LIMIT_RPS,
        help = "Token refill rate per client IP (requests per second)"
    )]
    pub rate_limit_rps: f64,
    #[arg(
        long,
        env = "RATE_LIMIT_BURST",
        default_value_t = DEFAULT_RATE_LIMIT_BURST,
        help = "Token bucket capacity per client IP"
    )]
    pub rate_limit_burst: u32,
    #[arg(
        long,
        env = "VISITOR_TTL_SECS",
        default_value_t = DEFAULT_VISITOR_TTL_SECS,
        help = "Seconds of inactivity before a client IP is forgotten"
    )]
    pub visitor_ttl_secs: u64,
    #[arg(
        long,
        env = "VISITOR_SWEEP_SECS",
        default_value_t = DEFAULT_VISITOR_SWEEP_SECS,
        help = "Interval in seconds between expired visitor sweeps"
    )]
    pub visitor_sweep_secs: u64,
    #[arg(
        long,
        env = "TRUST_PROXY",
        default_value_t = false,
        help = "Take the client IP from X-Forwarded-For or X-Real-IP"
    )]
    pub trust_proxy: bool,
    #[arg(long, env = "CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "SHUTDOWN_GRACE_SECS",
        default_value_t = DEFAULT_SHUTDOWN_GRACE_SECS,
        help = "Grace period for in-flight requests on shutdown"
    )]
    pub shutdown_grace_secs: u64,
    #[arg(
        long,
        env = "LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        help = "Log output format"
    )]
    pub log_format: LogFormat,
}

/// Listener and timeout settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub public_dir: PathBuf,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
    pub cors_origins: Option<String>,
    pub trust_proxy: bool,
}

/// Settings consumed by the upload handler.
#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub upload_dir: PathBuf,
    pub base_url: String,
    pub max_upload_size: u64,
}

impl UploadConfig {
    pub fn max_upload_size_mb(&self) -> u64 {
        self.max_upload_size / BYTES_PER_MB
    }

    /// Public URL of a stored file.
    pub fn public_url(&self, name: &str) -> String {
        format!("{}/uploads/{}", self.base_url.trim_end_matches('/'), name)
    }
}

/// Per-IP token bucket parameters.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub rate: f64,
    pub burst: u32,
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE_LIMIT_RPS,
            burst: DEFAULT_RATE_LIMIT_BURST,
            ttl: Duration::from_secs(DEFAULT_VISITOR_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_VISITOR_SWEEP_SECS),
        }
    }
}

/// Fully resolved configuration, built once at startup.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub rate_limit: RateLimitConfig,
    pub log_format: LogFormat,
}

impl TryFrom<Args> for AppConfig {
    type Error = std::io::Error;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let addr = parse_listen_addr(&args.port)?;
        if !(args.rate_limit_rps.is_finite() && args.rate_limit_rps > 0.0) {
            return Err(invalid_input("RATE_LIMIT_RPS must be a positive number"));
        }
        if args.rate_limit_burst == 0 {
            return Err(invalid_input("RATE_LIMIT_BURST must be at least 1"));
        }
        if args.visitor_ttl_secs == 0 {
            return Err(invalid_input("VISITOR_TTL_SECS must be at least 1"));
        }
        if args.visitor_sweep_secs == 0 {
            return Err(invalid_input("VISITOR_SWEEP_SECS must be at least 1"));
        }
        if args.read_timeout == 0 || args.write_timeout == 0 || args.idle_timeout == 0 {
            return Err(invalid_input("timeouts must be at least 1 second"));
        }
        let base_url = args
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| default_base_url(&args.port));

        Ok(Self {
            server: ServerConfig {
                addr,
                public_dir: PathBuf::from(args.public_dir),
                read_timeout: Duration::from_secs(args.read_timeout),
                write_timeout: Duration::from_secs(args.write_timeout),
                idle_timeout: Duration::from_secs(args.idle_timeout),
                shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
                cors_origins: args.cors_origins,
                trust_proxy: args.trust_proxy,
            },
            upload: UploadConfig {
                upload_dir: PathBuf::from(args.upload_dir),
                base_url,
                max_upload_size: args.max_upload_size_mb.saturating_mul(BYTES_PER_MB),
            },
            rate_limit: RateLimitConfig {
                rate: args.rate_limit_rps,
                burst: args.rate_limit_burst,
                ttl: Duration::from_secs(args.visitor_ttl_secs),
                sweep_interval: Duration::from_secs(args.visitor_sweep_secs),
            },
            log_format: args.log_format,
        })
    }
}

/// Parses `:8880`, `8880`, `127.0.0.1:8880` or `[::1]:8880`.
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr, std::io::Error> {
    let value = value.trim();
    if let Some(port) = value.strip_prefix(':') {
        return parse_port(port)
            .map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(port) = value.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    value
        .parse::<SocketAddr>()
        .map_err(|err| invalid_input(&format!("invalid listen address {value:?}: {err}")))
}

fn parse_port(value: &str) -> Result<u16, std::io::Error> {
    value
        .parse::<u16>()
        .map_err(|err| invalid_input(&format!("invalid port {value:?}: {err}")))
}

fn default_base_url(port: &str) -> String {
    let port = port.trim();
    if port.starts_with(':') {
        format!("http://localhost{port}")
    } else if port.parse::<u16>().is_ok() {
        format!("http://localhost:{port}")
    } else {
        format!("http://{port}")
    }
}

fn invalid_input(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message.to_string())
}
