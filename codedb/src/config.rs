use config::{Config as ConfigBuilder, File};
use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::errors::{CodeDbError, CodeDbResult};

/// Settings of one code database, persisted in `.codedb/config.yaml`.
///
/// # Configuration Locations
///
/// Values are layered, later sources overriding earlier ones:
/// 1. Built-in defaults
/// 2. Global `$HOME/.config/codedb/config.yaml`
/// 3. The database's own `.codedb/config.yaml`
///
/// # Configuration Format
///
/// ```yaml
/// # Files whose name fully matches this regex are indexed
/// file-include: ".*\\.(c|h|cpp|hpp)"
///
/// # Directories whose name fully matches this regex are skipped
/// dir-exclude: "(\\.git|\\.svn|\\.codedb)"
///
/// # Strip leading/trailing whitespace from every indexed line
/// build-trim-ws: off
///
/// # Strip leading whitespace from printed match lines
/// find-trim-ws: on
///
/// # Match the subdirectory filter case-insensitively
/// nocase-file-match: off
///
/// # Uncompressed chunk size soft cap in bytes
/// chunk-size: 524288
///
/// # Search worker threads (default: CPU cores)
/// thread-count: 8
/// ```
///
/// The same keys are reachable through [`CodeDbConfig::get_value`] and
/// [`CodeDbConfig::set_value`], which back the `codedb config` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CodeDbConfig {
    /// Regex a file name must fully match to be indexed
    #[serde(default = "default_file_include")]
    pub file_include: String,

    /// Regex a directory name must fully match to be pruned from the walk
    #[serde(default = "default_dir_exclude")]
    pub dir_exclude: String,

    /// Trim leading and trailing space/tab from every line at build time
    #[serde(default)]
    pub build_trim_ws: bool,

    /// Trim leading space/tab from the line text printed by find
    #[serde(default)]
    pub find_trim_ws: bool,

    /// Compile the subdirectory file filter case-insensitively
    #[serde(default)]
    pub nocase_file_match: bool,

    /// Soft cap on the uncompressed size of one chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Number of search worker threads
    #[serde(default = "default_thread_count")]
    pub thread_count: NonZeroUsize,
}

pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Keys accepted by `get_value`/`set_value`, in display order
pub const CONFIG_KEYS: &[&str] = &[
    "file-include",
    "dir-exclude",
    "build-trim-ws",
    "find-trim-ws",
    "nocase-file-match",
    "chunk-size",
    "thread-count",
];

fn default_file_include() -> String {
    r".*\.(c|cc|cpp|cxx|h|hh|hpp|hxx|inl|rs|py|go|java|js|ts)".to_string()
}

fn default_dir_exclude() -> String {
    r"(\.git|\.svn|\.hg|\.codedb|target)".to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_thread_count() -> NonZeroUsize {
    NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN)
}

impl Default for CodeDbConfig {
    fn default() -> Self {
        Self {
            file_include: default_file_include(),
            dir_exclude: default_dir_exclude(),
            build_trim_ws: false,
            find_trim_ws: false,
            nocase_file_match: false,
            chunk_size: default_chunk_size(),
            thread_count: default_thread_count(),
        }
    }
}

impl CodeDbConfig {
    /// Loads the global config layered under the database's own file
    pub fn load(config_path: &Path) -> CodeDbResult<Self> {
        let global = dirs::config_dir().map(|p| p.join("codedb/config.yaml"));
        Self::load_layers(&[global, Some(config_path.to_path_buf())])
    }

    /// Loads a single config file, falling back to defaults for missing keys
    pub fn load_file(config_path: &Path) -> CodeDbResult<Self> {
        Self::load_layers(&[Some(config_path.to_path_buf())])
    }

    fn load_layers(paths: &[Option<PathBuf>]) -> CodeDbResult<Self> {
        let mut builder = ConfigBuilder::builder();
        for path in paths.iter().flatten() {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            }
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Writes the config as YAML
    pub fn save(&self, config_path: &Path) -> CodeDbResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(config_path, yaml)?;
        Ok(())
    }

    /// Returns the string form of a config value
    pub fn get_value(&self, key: &str) -> CodeDbResult<String> {
        let value = match key {
            "file-include" => self.file_include.clone(),
            "dir-exclude" => self.dir_exclude.clone(),
            "build-trim-ws" => toggle_str(self.build_trim_ws).to_string(),
            "find-trim-ws" => toggle_str(self.find_trim_ws).to_string(),
            "nocase-file-match" => toggle_str(self.nocase_file_match).to_string(),
            "chunk-size" => self.chunk_size.to_string(),
            "thread-count" => self.thread_count.to_string(),
            _ => return Err(unknown_key(key)),
        };
        Ok(value)
    }

    /// Parses and stores a config value given in string form
    pub fn set_value(&mut self, key: &str, value: &str) -> CodeDbResult<()> {
        match key {
            "file-include" => self.file_include = value.to_string(),
            "dir-exclude" => self.dir_exclude = value.to_string(),
            "build-trim-ws" => self.build_trim_ws = parse_toggle(key, value)?,
            "find-trim-ws" => self.find_trim_ws = parse_toggle(key, value)?,
            "nocase-file-match" => self.nocase_file_match = parse_toggle(key, value)?,
            "chunk-size" => {
                self.chunk_size = value.parse().map_err(|_| {
                    CodeDbError::config_error(format!("{key} expects a byte count, got '{value}'"))
                })?
            }
            "thread-count" => {
                self.thread_count = value.parse().map_err(|_| {
                    CodeDbError::config_error(format!(
                        "{key} expects a positive number, got '{value}'"
                    ))
                })?
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    /// All keys with their current values
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        CONFIG_KEYS
            .iter()
            .filter_map(|key| self.get_value(key).ok().map(|value| (*key, value)))
            .collect()
    }
}

fn toggle_str(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn parse_toggle(key: &str, value: &str) -> CodeDbResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(CodeDbError::config_error(format!(
            "{key} expects on or off, got '{value}'"
        ))),
    }
}

fn unknown_key(key: &str) -> CodeDbError {
    CodeDbError::config_error(format!("unknown key '{key}'"))
}
