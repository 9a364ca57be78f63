//! Persistent application configuration model, defaults, and loading.

use std::path::{Path, PathBuf};

use log::{info, LevelFilter};

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "WHATFLOWER_CONFIG";
/// Knowledge-base search endpoint used when none is configured.
pub const DEFAULT_KNOWLEDGE_ENDPOINT: &str = "https://en.wikipedia.org/w/api.php";

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    /// Knowledge-base endpoint and transport preferences.
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    /// Thumbnail download and disk cache preferences.
    pub thumbnails: ThumbnailConfig,
    #[serde(default)]
    /// Theme derivation knobs.
    pub theme: ThemeConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Requested thumbnail edge, sent as `pithumbsize`.
    #[serde(default = "default_thumbnail_size_px")]
    pub thumbnail_size_px: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Total attempts for timeout-class failures; 1 disables retrying.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_thumbnail_cache_max_size_mb")]
    pub cache_max_size_mb: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ThemeConfig {
    /// Fraction toward white used for the lightened background.
    #[serde(default = "default_lighten_fraction")]
    pub lighten_fraction: f32,
    #[serde(default = "default_true")]
    pub prefer_flat: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ClassifierConfig {
    /// Top labels below this confidence count as not identified.
    #[serde(default)]
    pub min_confidence: f32,
}

/// Failures while locating, reading, or creating the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config directory available on this platform")]
    NoConfigDir,
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_knowledge_endpoint(),
            user_agent: default_user_agent(),
            thumbnail_size_px: default_thumbnail_size_px(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_attempts: default_max_attempts(),
            min_request_interval_ms: default_min_request_interval_ms(),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_max_size_mb: default_thumbnail_cache_max_size_mb(),
            request_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            lighten_fraction: default_lighten_fraction(),
            prefer_flat: true,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
        }
    }
}

impl LoggingConfig {
    /// Parsed level; unknown values fall back to `Info`.
    pub fn level_filter(&self) -> LevelFilter {
        self.level.trim().parse().unwrap_or(LevelFilter::Info)
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_knowledge_endpoint() -> String {
    DEFAULT_KNOWLEDGE_ENDPOINT.to_string()
}

fn default_user_agent() -> String {
    format!(
        "whatflower/{} (flower identification; contact: knowledge enrichment)",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_thumbnail_size_px() -> u32 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    7_000
}

fn default_max_attempts() -> u32 {
    1
}

fn default_min_request_interval_ms() -> u64 {
    200
}

fn default_thumbnail_cache_max_size_mb() -> u32 {
    64
}

fn default_lighten_fraction() -> f32 {
    0.2
}

/// Clamps every numeric setting into its supported range.
pub fn sanitize_config(config: Config) -> Config {
    let endpoint = if config.knowledge.endpoint.trim().is_empty() {
        default_knowledge_endpoint()
    } else {
        config.knowledge.endpoint.trim().to_string()
    };
    let user_agent = if config.knowledge.user_agent.trim().is_empty() {
        default_user_agent()
    } else {
        config.knowledge.user_agent.trim().to_string()
    };
    let lighten_fraction = if config.theme.lighten_fraction.is_nan() {
        default_lighten_fraction()
    } else {
        config.theme.lighten_fraction.clamp(0.0, 1.0)
    };
    let min_confidence = if config.classifier.min_confidence.is_nan() {
        0.0
    } else {
        config.classifier.min_confidence.clamp(0.0, 1.0)
    };

    Config {
        logging: config.logging,
        knowledge: KnowledgeConfig {
            endpoint,
            user_agent,
            thumbnail_size_px: config.knowledge.thumbnail_size_px.clamp(16, 4_096),
            connect_timeout_ms: config.knowledge.connect_timeout_ms.max(100),
            read_timeout_ms: config.knowledge.read_timeout_ms.max(100),
            max_attempts: config.knowledge.max_attempts.clamp(1, 5),
            min_request_interval_ms: config.knowledge.min_request_interval_ms.min(60_000),
        },
        thumbnails: ThumbnailConfig {
            cache_enabled: config.thumbnails.cache_enabled,
            cache_max_size_mb: config.thumbnails.cache_max_size_mb.max(1),
            request_timeout_ms: config.thumbnails.request_timeout_ms.max(100),
        },
        theme: ThemeConfig {
            lighten_fraction,
            prefer_flat: config.theme.prefer_flat,
        },
        classifier: ClassifierConfig { min_confidence },
    }
}

/// Returns the config path, honoring [`CONFIG_PATH_ENV`].
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|root| root.join("whatflower").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Reads the config file, writing defaults first when it does not exist.
pub fn load_or_create_config(path: &Path) -> Result<Config, ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let default_config = sanitize_config(Config::default());
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        std::fs::write(path, toml::to_string(&default_config)?).map_err(io_error)?;
        return Ok(default_config);
    }

    let content = std::fs::read_to_string(path).map_err(io_error)?;
    parse_config(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_config(content: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(content).map(sanitize_config)
}
