/// Error types shared by every codedb component.
///
/// Each failure class of the corpus pipeline maps to one variant:
///
/// - `Io`: opening, reading or writing a file failed
/// - `InvalidFormat`: the container does not start with the expected tag
/// - `CorruptChunk`: a chunk could not be decompressed or its descriptor table
///   points outside the decoded buffer
/// - `InvalidPattern`: a regular expression failed to compile
///
/// All of them are fatal to the command that hit them; the CLI prints one
/// diagnostic line and exits with a non-zero status.
///
/// ```rust,ignore
/// match CorpusReader::open(&path) {
///     Ok(reader) => // Search it,
///     Err(CodeDbError::InvalidFormat(path)) => // Not a codedb container,
///     Err(e) => // Anything else
/// }
/// ```
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for codedb operations
pub type CodeDbResult<T> = Result<T, CodeDbError>;

/// Errors that can occur while building or searching a corpus
#[derive(Error, Debug)]
pub enum CodeDbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid container format: {0}")]
    InvalidFormat(PathBuf),
    #[error("Corrupt chunk: {0}")]
    CorruptChunk(String),
    #[error("invalid regex '{pattern}': {message}")]
    InvalidPattern { message: String, pattern: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("CodeDB not found in {0} or any parent directory (see: codedb init)")]
    DatabaseNotFound(PathBuf),
    #[error("{0} already exists")]
    AlreadyInitialized(PathBuf),
    #[error("Unable to start search threads: {0}")]
    ThreadPool(String),
    #[error("Search cancelled")]
    Cancelled,
}

impl CodeDbError {
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_format(path: impl AsRef<Path>) -> Self {
        Self::InvalidFormat(path.as_ref().to_path_buf())
    }

    pub fn corrupt_chunk(msg: impl Into<String>) -> Self {
        Self::CorruptChunk(msg.into())
    }

    pub fn invalid_pattern(message: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::InvalidPattern {
            message: message.into(),
            pattern: pattern.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn database_not_found(start: impl Into<PathBuf>) -> Self {
        Self::DatabaseNotFound(start.into())
    }

    pub fn already_initialized(path: impl Into<PathBuf>) -> Self {
        Self::AlreadyInitialized(path.into())
    }

    /// True for errors that mean the container itself can't be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::InvalidFormat(_) | Self::CorruptChunk(_))
    }
}

impl From<config::ConfigError> for CodeDbError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for CodeDbError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_error_creation() {
        let err = CodeDbError::invalid_format(Path::new("blob"));
        assert!(matches!(err, CodeDbError::InvalidFormat(_)));
        assert!(err.is_corruption());

        let err = CodeDbError::corrupt_chunk("name offset out of range");
        assert!(matches!(err, CodeDbError::CorruptChunk(_)));
        assert!(err.is_corruption());

        let err = CodeDbError::invalid_pattern("unclosed group", "(foo");
        assert!(matches!(err, CodeDbError::InvalidPattern { .. }));
        assert!(!err.is_corruption());

        let err = CodeDbError::config_error("unknown key");
        assert!(matches!(err, CodeDbError::Config(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = CodeDbError::invalid_pattern("unclosed group", "(foo");
        assert_eq!(err.to_string(), "invalid regex '(foo': unclosed group");

        let err = CodeDbError::corrupt_chunk("truncated header");
        assert_eq!(err.to_string(), "Corrupt chunk: truncated header");

        let err = CodeDbError::config_error("unknown key 'foo'");
        assert_eq!(err.to_string(), "Configuration error: unknown key 'foo'");

        let err = CodeDbError::already_initialized("/tmp/x/.codedb");
        assert_eq!(err.to_string(), "/tmp/x/.codedb already exists");
    }
}
