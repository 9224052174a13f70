//! Harvester configuration.
//!
//! Values come from an optional JSON settings file layered under command-line
//! overrides. [`Settings`] is the loose, all-optional form; [`HarvesterConfig`]
//! is the validated form the harvester runs with.

use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default seconds between the end of one pass and the start of the next.
pub const DEFAULT_INTERVAL_SECS: u64 = 10;

/// Default candidate filter: names ending in `.jpg` (case-sensitive).
pub const DEFAULT_FILE_PATTERN: &str = r"\.jpg$";

/// Default location of the persisted watermark.
pub const DEFAULT_STATE_FILE: &str = "config.json";

/// Default number of consecutive failing passes a file or unreadable
/// directory may hold the watermark back before it is given up on.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid file pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("Scan interval must be at least one second")]
    ZeroInterval,

    #[error("Source and output directories must differ: {0}")]
    SameDirectories(PathBuf),

    #[error("Output directory '{output}' lies inside source directory '{source_dir}'")]
    OutputInsideSource { output: PathBuf, source_dir: PathBuf },
}

/// Partially specified settings, as read from a file or the command line.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub source_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub interval_secs: Option<u64>,
    pub file_pattern: Option<String>,
    pub state_file: Option<PathBuf>,
    pub retry_limit: Option<u32>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Layers `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merge(self, overrides: Settings) -> Settings {
        Settings {
            source_dir: overrides.source_dir.or(self.source_dir),
            output_dir: overrides.output_dir.or(self.output_dir),
            interval_secs: overrides.interval_secs.or(self.interval_secs),
            file_pattern: overrides.file_pattern.or(self.file_pattern),
            state_file: overrides.state_file.or(self.state_file),
            retry_limit: overrides.retry_limit.or(self.retry_limit),
        }
    }

    pub fn build(self) -> Result<HarvesterConfig, ConfigError> {
        let source_dir = self.source_dir.ok_or(ConfigError::Missing("source_dir"))?;
        let output_dir = self.output_dir.ok_or(ConfigError::Missing("output_dir"))?;

        let mut config = HarvesterConfig::new(source_dir, output_dir)?;
        if let Some(secs) = self.interval_secs {
            config = config.with_interval(Duration::from_secs(secs))?;
        }
        if let Some(pattern) = self.file_pattern {
            config = config.with_pattern(&pattern)?;
        }
        if let Some(state_file) = self.state_file {
            config = config.with_state_file(state_file);
        }
        if let Some(limit) = self.retry_limit {
            config = config.with_retry_limit(limit);
        }
        Ok(config)
    }
}

/// Validated configuration for a [`Harvester`](crate::harvest::Harvester).
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    /// Root of the tree scanned for new files
    pub source_dir: PathBuf,

    /// Flat directory receiving copies
    pub output_dir: PathBuf,

    /// Delay between passes
    pub interval: Duration,

    /// Candidate filter applied to file names
    pub file_filter: Regex,

    /// Where the watermark is persisted
    pub state_file: PathBuf,

    /// Failing passes tolerated before the watermark moves past a failure
    pub retry_limit: u32,
}

impl HarvesterConfig {
    /// Creates a configuration with the default interval, filter and state file.
    ///
    /// The output directory may not be the source directory or sit anywhere
    /// beneath it, otherwise copies would be harvested again.
    pub fn new(source_dir: PathBuf, output_dir: PathBuf) -> Result<Self, ConfigError> {
        let source = resolve(&source_dir);
        let output = resolve(&output_dir);
        if source == output {
            return Err(ConfigError::SameDirectories(source_dir));
        }
        if output.starts_with(&source) {
            return Err(ConfigError::OutputInsideSource {
                output: output_dir,
                source_dir,
            });
        }
        Ok(Self {
            source_dir,
            output_dir,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            file_filter: compile_pattern(DEFAULT_FILE_PATTERN)?,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            retry_limit: DEFAULT_RETRY_LIMIT,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.as_secs() == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        self.interval = interval;
        Ok(self)
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, ConfigError> {
        self.file_filter = compile_pattern(pattern)?;
        Ok(self)
    }

    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = path;
        self
    }

    /// `0` never holds the watermark back for failures.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }
}

/// Absolute, symlink-free form of `path`. The deepest existing ancestor is
/// canonicalized and the missing tail re-appended.
fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut existing = absolute.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            return tail.iter().rev().fold(real, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}
