use crate::rules::RequireRules;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_PORT: u16 = 1999;
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_QUOTE_CHAR: char = '=';
pub const DEFAULT_CLIENT_TIMEOUT: u64 = 300;

/// Configuration problems that keep the filter from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Forward rewriting enabled but no rewrite domain configured.
    MissingDomain,
    /// `rewrite.quote_char` is not a single ASCII character.
    InvalidQuoteChar(String),
    /// `log_level` is not a known level name.
    InvalidLogLevel(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingDomain => {
                write!(f, "'domain' is required while forward rewriting is enabled")
            }
            ConfigError::InvalidQuoteChar(s) => {
                write!(f, "quote_char {:?} must be a single ASCII character", s)
            }
            ConfigError::InvalidLogLevel(s) => write!(f, "unknown log level {:?}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The `rewrite` section as it appears on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteSection {
    pub quote_char: Option<String>,
    pub forward: Option<bool>,
    pub reverse: Option<bool>,
    pub require: Option<RequireRules>,
}

/// Legacy nested `dmarc` section. Carries the same keys as the top level;
/// each one is consulted only when the top-level key is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacySection {
    pub domain: Option<String>,
    pub milter_port: Option<u16>,
    pub listen_address: Option<String>,
    pub socket_path: Option<String>,
    pub client_timeout: Option<u64>,
    pub log_level: Option<String>,
    pub rewrite: Option<RewriteSection>,
}

/// On-disk configuration. Every key is optional so resolution can fall back
/// key by key to the legacy `dmarc` section and then to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub domain: Option<String>,
    pub milter_port: Option<u16>,
    pub listen_address: Option<String>,
    pub socket_path: Option<String>,
    pub client_timeout: Option<u64>,
    pub log_level: Option<String>,
    pub rewrite: Option<RewriteSection>,
    pub dmarc: Option<LegacySection>,
}

/// Fully resolved runtime settings, immutable after startup and shared by
/// every session.
#[derive(Debug, Clone)]
pub struct Settings {
    pub domain: Option<String>,
    pub milter_port: u16,
    pub listen_address: String,
    pub socket_path: Option<String>,
    pub client_timeout: u64,
    pub log_level: log::LevelFilter,
    pub quote_char: char,
    pub forward: bool,
    pub reverse: bool,
    pub require: RequireRules,
}

impl FileConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FileConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A starting-point configuration for `--generate-config`.
    pub fn sample() -> Self {
        FileConfig {
            domain: Some("dmarc.example.com".to_string()),
            milter_port: Some(DEFAULT_PORT),
            listen_address: Some(DEFAULT_LISTEN_ADDRESS.to_string()),
            socket_path: None,
            client_timeout: Some(DEFAULT_CLIENT_TIMEOUT),
            log_level: Some("info".to_string()),
            rewrite: Some(RewriteSection {
                quote_char: Some("=".to_string()),
                forward: Some(true),
                reverse: Some(true),
                require: Some(
                    [(
                        "x-mailman-version".to_string(),
                        crate::rules::RequireValue::Present(true),
                    )]
                    .into_iter()
                    .collect(),
                ),
            }),
            dmarc: None,
        }
    }

    /// Flatten the two-tier lookup into immutable [`Settings`]. Performed
    /// once at startup; key-by-key precedence is top level, then the legacy
    /// `dmarc` section, then the default. Never a deep merge.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let legacy = self.dmarc.unwrap_or_default();
        let rewrite = self.rewrite.unwrap_or_default();
        let legacy_rewrite = legacy.rewrite.unwrap_or_default();

        let quote_raw = rewrite
            .quote_char
            .or(legacy_rewrite.quote_char)
            .unwrap_or_else(|| DEFAULT_QUOTE_CHAR.to_string());
        let mut chars = quote_raw.chars();
        let quote_char = match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() => c,
            _ => return Err(ConfigError::InvalidQuoteChar(quote_raw)),
        };

        let log_level_raw = self
            .log_level
            .or(legacy.log_level)
            .unwrap_or_else(|| "warn".to_string());
        let log_level =
            parse_log_level(&log_level_raw).ok_or(ConfigError::InvalidLogLevel(log_level_raw))?;

        let forward = rewrite.forward.or(legacy_rewrite.forward).unwrap_or(true);
        let reverse = rewrite.reverse.or(legacy_rewrite.reverse).unwrap_or(true);
        let domain = self.domain.or(legacy.domain);
        if forward && domain.is_none() {
            return Err(ConfigError::MissingDomain);
        }

        Ok(Settings {
            domain,
            milter_port: self
                .milter_port
                .or(legacy.milter_port)
                .unwrap_or(DEFAULT_PORT),
            listen_address: self
                .listen_address
                .or(legacy.listen_address)
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string()),
            socket_path: self.socket_path.or(legacy.socket_path),
            client_timeout: self
                .client_timeout
                .or(legacy.client_timeout)
                .unwrap_or(DEFAULT_CLIENT_TIMEOUT),
            log_level,
            quote_char,
            forward,
            reverse,
            require: rewrite
                .require
                .or(legacy_rewrite.require)
                .unwrap_or_default(),
        })
    }
}

fn parse_log_level(name: &str) -> Option<log::LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "off" => Some(log::LevelFilter::Off),
        "error" => Some(log::LevelFilter::Error),
        "warn" | "warning" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}
