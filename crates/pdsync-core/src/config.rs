//! Configuration module for pdsync.
//!
//! Typed configuration structs mapping to the JSON configuration file,
//! with loading, validation and defaults. A parse failure is fatal to
//! startup; validation collects every problem before reporting.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration for pdsync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directories to mirror and their remote prefixes. Required, at
    /// least one entry.
    pub sync_dirs: Vec<SyncDirConfig>,

    /// Maximum number of in-flight jobs.
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: u32,

    /// Glob patterns for paths the watcher and scanner skip.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Directory for the local-directory drive backend. When set, `start`
    /// mirrors into this directory instead of the remote service; the real
    /// backend is selected by leaving it unset.
    #[serde(default)]
    pub local_drive_path: Option<PathBuf>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One sync root: a local directory mirrored under a remote prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDirConfig {
    /// Local directory to mirror
    pub source_path: PathBuf,
    /// Remote path prefix the directory is mirrored under
    pub remote_root: String,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path of the rotating log file. `None` disables file logging.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Maximum size of a single log file (MiB) before rotation.
    #[serde(default = "default_log_max_size")]
    pub max_size_mib: u64,
    /// Number of log files retained, the active one included.
    #[serde(default = "default_log_max_files")]
    pub max_files: u32,
}

fn default_sync_concurrency() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_size() -> u64 {
    1
}

fn default_log_max_files() -> u32 {
    2
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            max_size_mib: default_log_max_size(),
            max_files: default_log_max_files(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/pdsync/config.json` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("pdsync")
            .join("config.json")
    }

    /// Default location of the state database.
    ///
    /// Typically `$XDG_STATE_HOME/pdsync/state.db` on Linux.
    pub fn default_state_db_path() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pdsync")
            .join("state.db")
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync_dirs[1].source_path"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync_dirs ---
        if self.sync_dirs.is_empty() {
            errors.push(ValidationError {
                field: "sync_dirs".into(),
                message: "at least one sync directory is required".into(),
            });
        }

        for (i, dir) in self.sync_dirs.iter().enumerate() {
            if !dir.source_path.is_absolute() {
                errors.push(ValidationError {
                    field: format!("sync_dirs[{i}].source_path"),
                    message: format!(
                        "must be an absolute path: {}",
                        dir.source_path.display()
                    ),
                });
            }
            if !dir.remote_root.starts_with('/') {
                errors.push(ValidationError {
                    field: format!("sync_dirs[{i}].remote_root"),
                    message: format!("must start with '/': {}", dir.remote_root),
                });
            }
        }

        // Nested or duplicate roots make ownership of a path ambiguous.
        for (i, a) in self.sync_dirs.iter().enumerate() {
            for (j, b) in self.sync_dirs.iter().enumerate().skip(i + 1) {
                if a.source_path.starts_with(&b.source_path)
                    || b.source_path.starts_with(&a.source_path)
                {
                    errors.push(ValidationError {
                        field: format!("sync_dirs[{j}].source_path"),
                        message: format!(
                            "overlaps sync_dirs[{i}]: {} and {}",
                            a.source_path.display(),
                            b.source_path.display()
                        ),
                    });
                }
            }
        }

        // --- sync_concurrency ---
        if self.sync_concurrency == 0 {
            errors.push(ValidationError {
                field: "sync_concurrency".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- local_drive_path ---
        if let Some(path) = &self.local_drive_path {
            if !path.is_absolute() {
                errors.push(ValidationError {
                    field: "local_drive_path".into(),
                    message: format!("must be an absolute path: {}", path.display()),
                });
            }
        }

        // --- exclude_patterns ---
        for (i, pattern) in self.exclude_patterns.iter().enumerate() {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(ValidationError {
                    field: format!("exclude_patterns[{i}]"),
                    message: format!("invalid glob '{pattern}': {e}"),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if self.logging.max_size_mib == 0 {
            errors.push(ValidationError {
                field: "logging.max_size_mib".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.logging.max_files == 0 {
            errors.push(ValidationError {
                field: "logging.max_files".into(),
                message: "must be greater than 0".into(),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn minimal() -> Config {
        Config {
            sync_dirs: vec![SyncDirConfig {
                source_path: PathBuf::from("/home/user/Documents"),
                remote_root: "/backup".to_string(),
            }],
            sync_concurrency: default_sync_concurrency(),
            exclude_patterns: Vec::new(),
            local_drive_path: None,
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn minimal_config_passes_validation() {
        assert!(minimal().validate().is_empty());
    }

    #[test]
    fn defaults_applied_on_load() {
        let json = r#"{
            "sync_dirs": [
                { "source_path": "/home/user/Documents", "remote_root": "/backup" }
            ]
        }"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(json.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync_concurrency, 8);
        assert!(cfg.exclude_patterns.is_empty());
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.max_size_mib, 1);
        assert_eq!(cfg.logging.max_files, 2);
    }

    #[test]
    fn load_returns_error_on_invalid_json() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"{ not json").unwrap();
        tmp.flush().unwrap();
        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn load_returns_error_on_missing_sync_dirs() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"{}").unwrap();
        tmp.flush().unwrap();
        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn validate_catches_empty_sync_dirs() {
        let mut cfg = minimal();
        cfg.sync_dirs.clear();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "sync_dirs"));
    }

    #[test]
    fn validate_catches_relative_source_path() {
        let mut cfg = minimal();
        cfg.sync_dirs[0].source_path = PathBuf::from("Documents");
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "sync_dirs[0].source_path"));
    }

    #[test]
    fn validate_catches_bad_remote_root() {
        let mut cfg = minimal();
        cfg.sync_dirs[0].remote_root = "backup".to_string();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "sync_dirs[0].remote_root"));
    }

    #[test]
    fn validate_rejects_nested_roots() {
        let mut cfg = minimal();
        cfg.sync_dirs.push(SyncDirConfig {
            source_path: PathBuf::from("/home/user/Documents/projects"),
            remote_root: "/projects".to_string(),
        });
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.message.contains("overlaps")));
    }

    #[test]
    fn validate_rejects_duplicate_roots() {
        let mut cfg = minimal();
        cfg.sync_dirs.push(cfg.sync_dirs[0].clone());
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.message.contains("overlaps")));
    }

    #[test]
    fn validate_catches_zero_concurrency() {
        let mut cfg = minimal();
        cfg.sync_concurrency = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "sync_concurrency"));
    }

    #[test]
    fn validate_catches_relative_local_drive_path() {
        let mut cfg = minimal();
        cfg.local_drive_path = Some(PathBuf::from("relative/drive"));
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "local_drive_path"));
    }

    #[test]
    fn validate_catches_invalid_glob() {
        let mut cfg = minimal();
        cfg.exclude_patterns.push("[".to_string());
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "exclude_patterns[0]"));
    }

    #[test]
    fn validate_catches_invalid_log_level() {
        let mut cfg = minimal();
        cfg.logging.level = "verbose".to_string();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "logging.level"));
    }

    #[test]
    fn default_path_ends_with_config_json() {
        let p = Config::default_path();
        assert!(p.ends_with("pdsync/config.json"));
    }
}
