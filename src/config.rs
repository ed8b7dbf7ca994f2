// Configuration management for codeatlas

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AtlasError, Result};

/// Name of the per-project configuration file
pub const CONFIG_FILE: &str = ".codeatlas.toml";

/// Directory holding the index database and session files
pub const DATA_DIR: &str = ".codeatlas";

/// Directories that are never indexed, whatever the configuration says.
pub const BUILTIN_IGNORES: &[&str] = &[
    ".git",
    ".codeatlas",
    "node_modules",
    "target",
    "__pycache__",
    "dist",
    "build",
    ".venv",
    "venv",
];

const MAX_WORKERS_LIMIT: usize = 256;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub indexing: IndexingConfig,
    pub watch: WatchConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub max_workers: usize,
    pub parallel: bool,
    pub ignore_patterns: Vec<String>,
    pub include_hidden: bool,
    pub max_file_bytes: u64,
    pub parse_timeout_ms: u64,
    pub cache_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_max_tokens: usize,
    pub default_limit: usize,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            parallel: true,
            ignore_patterns: Vec::new(),
            include_hidden: false,
            max_file_bytes: 1024 * 1024,
            parse_timeout_ms: 10_000,
            cache_enabled: true,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 500,
            max_pending: 256,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 10_000,
            default_limit: 50,
            cache_ttl_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| AtlasError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from project directory.
    ///
    /// A missing `.codeatlas.toml` yields defaults; a malformed one is an error.
    pub fn from_project_dir<P: AsRef<Path>>(project_dir: P) -> Result<Self> {
        let config_path = project_dir.as_ref().join(CONFIG_FILE);

        if !config_path.exists() {
            tracing::debug!("No {} found, using default configuration", config_path.display());
            return Ok(Self::default());
        }

        let config = Self::from_file(&config_path)?;
        tracing::info!("Loaded configuration from {}", config_path.display());
        Ok(config)
    }

    /// Effective worker count. Sequential mode always uses one worker.
    pub fn worker_count(&self) -> usize {
        if self.indexing.parallel {
            self.indexing.max_workers
        } else {
            1
        }
    }

    /// Compile built-in and configured ignore patterns.
    pub fn ignore_matcher(&self) -> Result<IgnoreMatcher> {
        IgnoreMatcher::new(&self.indexing.ignore_patterns)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let idx = &self.indexing;
        if idx.max_workers == 0 || idx.max_workers > MAX_WORKERS_LIMIT {
            return Err(AtlasError::Config(format!(
                "max_workers must be between 1 and {}, got {}",
                MAX_WORKERS_LIMIT, idx.max_workers
            )));
        }
        if idx.max_file_bytes == 0 {
            return Err(AtlasError::Config(
                "max_file_bytes must be greater than 0".to_string(),
            ));
        }
        if idx.parse_timeout_ms == 0 {
            return Err(AtlasError::Config(
                "parse_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Surfaces bad globs before any scanning starts
        self.ignore_matcher()?;

        if self.watch.max_pending == 0 {
            return Err(AtlasError::Config(
                "watch.max_pending must be greater than 0".to_string(),
            ));
        }

        if self.query.default_max_tokens == 0 {
            return Err(AtlasError::Config(
                "query.default_max_tokens must be greater than 0".to_string(),
            ));
        }
        if self.query.default_limit == 0 {
            return Err(AtlasError::Config(
                "query.default_limit must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(AtlasError::Config(format!(
                "invalid log level: {}",
                self.logging.level
            )));
        }
        let valid_formats = ["compact", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(AtlasError::Config(format!(
                "invalid log format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }
}

/// Filesystem locations derived from a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub session_path: PathBuf,
    pub lifetime_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data_dir = root.join(DATA_DIR);
        Self {
            db_path: data_dir.join("index.db"),
            session_path: data_dir.join("session.json"),
            lifetime_path: data_dir.join("lifetime.json"),
            data_dir,
            root,
        }
    }
}

/// Compiled ignore rules, matched against root-relative paths.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    set: GlobSet,
}

impl IgnoreMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        for name in BUILTIN_IGNORES {
            add_glob(&mut builder, &format!("**/{}", name))?;
            add_glob(&mut builder, &format!("**/{}/**", name))?;
        }

        for pattern in patterns {
            let trimmed = pattern.trim().trim_end_matches('/');
            if trimmed.is_empty() {
                return Err(AtlasError::Config(format!(
                    "empty ignore pattern: '{}'",
                    pattern
                )));
            }
            if trimmed.contains('*') || trimmed.contains('?') || trimmed.contains('[') {
                add_glob(&mut builder, trimmed)?;
                if !trimmed.starts_with("**/") {
                    add_glob(&mut builder, &format!("**/{}", trimmed))?;
                }
            } else {
                // Plain names match a file or directory at any depth
                add_glob(&mut builder, &format!("**/{}", trimmed))?;
                add_glob(&mut builder, &format!("**/{}/**", trimmed))?;
            }
        }

        let set = builder
            .build()
            .map_err(|e| AtlasError::Config(format!("invalid ignore patterns: {}", e)))?;
        Ok(Self { set })
    }

    pub fn is_ignored(&self, relative: impl AsRef<Path>) -> bool {
        self.set.is_match(relative.as_ref())
    }
}

fn add_glob(builder: &mut GlobSetBuilder, pattern: &str) -> Result<()> {
    let glob = Glob::new(pattern)
        .map_err(|e| AtlasError::Config(format!("invalid ignore pattern '{}': {}", pattern, e)))?;
    builder.add(glob);
    Ok(())
}
