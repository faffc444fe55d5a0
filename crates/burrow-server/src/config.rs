//! Console configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (BURROW_*)
//! 2. Config file (burrow.toml)
//! 3. Default values

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_common::SecretRef;
use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "BURROW";

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_MAIN_DIR: &str = "/etc/burrow";
const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Console configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Address the console listens on
    pub listen_addr: Option<String>,

    /// Root directory for logs, domain records, credentials and generated files
    pub main_dir: Option<String>,

    /// Path to the cloudflared binary
    pub tunnel_bin: Option<String>,

    /// Path to the xray binary
    pub proxy_bin: Option<String>,

    /// Cloudflare API base URL
    pub api_base: Option<String>,

    /// Timeout for checked Cloudflare API calls
    pub api_timeout_secs: Option<u64>,

    /// Idle lifetime of a login session
    pub session_ttl_secs: Option<u64>,

    /// Force the Secure attribute on the session cookie
    pub secure_cookies: Option<bool>,

    /// First-run admin password (env://, file path, or plain value)
    pub admin_password: Option<SecretRef>,

    /// Serve the console over HTTPS
    pub tls: Option<TlsConfig>,

    /// Quick tunnel hostname probe: number of polls
    pub probe_attempts: Option<u32>,

    /// Quick tunnel hostname probe: delay between polls
    pub probe_interval_ms: Option<u64>,

    /// Per-client request budgets
    pub rate_limits: Option<RateLimitConfig>,
}

/// HTTPS certificate and key (env://, file path, or plain PEM)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: Option<SecretRef>,
    pub key: Option<SecretRef>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RateLimitConfig {
    pub login_per_minute: Option<u32>,
    pub password_per_hour: Option<u32>,
    pub default_per_hour: Option<u32>,
    pub default_per_day: Option<u32>,
}

/// Resolved per-client budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub login_per_minute: u32,
    pub password_per_hour: u32,
    pub default_per_hour: u32,
    pub default_per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            login_per_minute: 5,
            password_per_hour: 10,
            default_per_hour: 50,
            default_per_day: 200,
        }
    }
}

/// Resolved HTTPS material
#[derive(Debug, Clone)]
pub struct ResolvedTls {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Resolved console configuration with actual secret values
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub listen_addr: SocketAddr,
    pub main_dir: PathBuf,
    pub tunnel_bin: PathBuf,
    pub proxy_bin: PathBuf,
    pub api_base: String,
    pub api_timeout: Duration,
    pub session_ttl: Duration,
    pub secure_cookies: bool,
    pub admin_password: Option<String>,
    pub tls: Option<ResolvedTls>,
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    pub rate_limits: RateLimits,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn get_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

impl ConsoleConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedConfig> {
        let listen_raw = get_env("LISTEN_ADDR")
            .or(self.listen_addr)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = listen_raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", listen_raw, e))?;

        let main_dir = expand_path(
            &get_env("MAIN_DIR")
                .or(self.main_dir)
                .unwrap_or_else(|| DEFAULT_MAIN_DIR.to_string()),
        );

        let tunnel_bin = get_env("TUNNEL_BIN")
            .or(self.tunnel_bin)
            .map(|p| expand_path(&p))
            .unwrap_or_else(|| main_dir.join("cloudflared"));

        let proxy_bin = get_env("PROXY_BIN")
            .or(self.proxy_bin)
            .map(|p| expand_path(&p))
            .unwrap_or_else(|| main_dir.join("xray").join("xray"));

        let api_base = get_env("API_BASE")
            .or(self.api_base)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let api_timeout = Duration::from_secs(
            get_env_parsed("API_TIMEOUT_SECS")
                .or(self.api_timeout_secs)
                .unwrap_or(10),
        );

        let session_ttl = Duration::from_secs(
            get_env_parsed("SESSION_TTL_SECS")
                .or(self.session_ttl_secs)
                .unwrap_or(12 * 60 * 60),
        );

        let probe_attempts = get_env_parsed("PROBE_ATTEMPTS")
            .or(self.probe_attempts)
            .unwrap_or(12);
        let probe_interval = Duration::from_millis(
            get_env_parsed("PROBE_INTERVAL_MS")
                .or(self.probe_interval_ms)
                .unwrap_or(1000),
        );

        // Admin password: ENV > config > none (required only on first run)
        let admin_source = match get_env("ADMIN_PASSWORD") {
            Some(raw) => Some(
                raw.parse::<SecretRef>()
                    .map_err(|e| anyhow::anyhow!("Invalid admin password source: {}", e))?,
            ),
            None => self.admin_password,
        };
        let admin_password = admin_source
            .map(|source| {
                source
                    .resolve_exact()
                    .map_err(|e| anyhow::anyhow!("Failed to resolve admin password: {}", e))
            })
            .transpose()?;

        // TLS: ENV > config > disabled; both halves are required together
        let tls_config = self.tls.unwrap_or_default();
        let cert_source = match get_env("TLS_CERT") {
            Some(raw) => Some(raw.parse::<SecretRef>()?),
            None => tls_config.cert,
        };
        let key_source = match get_env("TLS_KEY") {
            Some(raw) => Some(raw.parse::<SecretRef>()?),
            None => tls_config.key,
        };
        let tls = match (cert_source, key_source) {
            (Some(cert), Some(key)) => {
                tracing::info!("Resolving TLS certificate and key...");
                Some(ResolvedTls {
                    cert_pem: cert
                        .resolve_trimmed()
                        .map_err(|e| anyhow::anyhow!("Failed to resolve TLS certificate: {}", e))?,
                    key_pem: key
                        .resolve_trimmed()
                        .map_err(|e| anyhow::anyhow!("Failed to resolve TLS key: {}", e))?,
                })
            }
            (None, None) => None,
            _ => anyhow::bail!(
                "TLS needs both a certificate and a key. Set BURROW_TLS_CERT and BURROW_TLS_KEY or tls.cert and tls.key in config"
            ),
        };

        let secure_cookies = get_env_bool("SECURE_COOKIES")
            .or(self.secure_cookies)
            .unwrap_or(tls.is_some());

        let limits = self.rate_limits.unwrap_or_default();
        let defaults = RateLimits::default();
        let rate_limits = RateLimits {
            login_per_minute: limits.login_per_minute.unwrap_or(defaults.login_per_minute),
            password_per_hour: limits
                .password_per_hour
                .unwrap_or(defaults.password_per_hour),
            default_per_hour: limits.default_per_hour.unwrap_or(defaults.default_per_hour),
            default_per_day: limits.default_per_day.unwrap_or(defaults.default_per_day),
        };

        Ok(ResolvedConfig {
            listen_addr,
            main_dir,
            tunnel_bin,
            proxy_bin,
            api_base,
            api_timeout,
            session_ttl,
            secure_cookies,
            admin_password,
            tls,
            probe_attempts,
            probe_interval,
            rate_limits,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}

impl ResolvedConfig {
    /// Defaults rooted at `main_dir`, ignoring the environment
    pub fn with_main_dir(main_dir: impl Into<PathBuf>) -> Self {
        let main_dir = main_dir.into();
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 5000))),
            tunnel_bin: main_dir.join("cloudflared"),
            proxy_bin: main_dir.join("xray").join("xray"),
            main_dir,
            api_base: DEFAULT_API_BASE.to_string(),
            api_timeout: Duration::from_secs(10),
            session_ttl: Duration::from_secs(12 * 60 * 60),
            secure_cookies: false,
            admin_password: None,
            tls: None,
            probe_attempts: 12,
            probe_interval: Duration::from_secs(1),
            rate_limits: RateLimits::default(),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.main_dir.join("logs")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.main_dir.join("configs")
    }

    pub fn creds_dir(&self) -> PathBuf {
        self.main_dir.join("creds")
    }

    pub fn yml_dir(&self) -> PathBuf {
        self.main_dir.join("yml")
    }

    pub fn xray_dir(&self) -> PathBuf {
        self.main_dir.join("xray")
    }

    pub fn users_file(&self) -> PathBuf {
        self.main_dir.join("users.json")
    }

    /// Create the directory layout under `main_dir`
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.logs_dir(),
            self.configs_dir(),
            self.creds_dir(),
            self.yml_dir(),
            self.xray_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                self.creds_dir(),
                std::fs::Permissions::from_mode(0o700),
            )?;
        }

        Ok(())
    }
}
