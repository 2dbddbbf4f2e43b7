use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::CodeDbConfig;
use crate::corpus::{build_corpus, BuildOptions, BuildSummary, CorpusReader};
use crate::errors::{CodeDbError, CodeDbResult};
use crate::lock::{FileLock, LockMode};
use crate::metrics::Metrics;

/// Name of the directory marking a database root
pub const DATABASE_DIR: &str = ".codedb";
const CONFIG_FILE: &str = "config.yaml";
const CONTAINER_FILE: &str = "blob";
const LOCK_FILE: &str = "lock";

/// A code database: an indexed source tree plus its `.codedb` directory.
///
/// The directory holds the container (`blob`), the settings
/// (`config.yaml`) and the build/search lock file (`lock`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    root: PathBuf,
}

impl Database {
    /// Creates `.codedb` under `root` with a default config
    pub fn init(root: &Path) -> CodeDbResult<Self> {
        let root = root.canonicalize()?;
        let db = Self { root };
        if db.dir().exists() {
            return Err(CodeDbError::already_initialized(db.dir()));
        }

        fs::create_dir_all(db.dir())?;
        CodeDbConfig::default().save(&db.config_path())?;
        info!("Initialized database in {}", db.dir().display());
        Ok(db)
    }

    /// Opens the database rooted exactly at `root`
    pub fn open(root: &Path) -> CodeDbResult<Self> {
        let root = root.canonicalize()?;
        if !root.join(DATABASE_DIR).is_dir() {
            return Err(CodeDbError::database_not_found(root));
        }
        Ok(Self { root })
    }

    /// Finds the nearest database at or above `start`
    pub fn discover(start: &Path) -> CodeDbResult<Self> {
        let start = start.canonicalize()?;
        for dir in start.ancestors() {
            if dir.join(DATABASE_DIR).is_dir() {
                debug!("Found database at {}", dir.display());
                return Ok(Self {
                    root: dir.to_path_buf(),
                });
            }
        }
        Err(CodeDbError::database_not_found(start))
    }

    /// The indexed source tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(DATABASE_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir().join(CONFIG_FILE)
    }

    pub fn container_path(&self) -> PathBuf {
        self.dir().join(CONTAINER_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir().join(LOCK_FILE)
    }

    /// Effective settings, global config layered under the database's own
    pub fn config(&self) -> CodeDbResult<CodeDbConfig> {
        CodeDbConfig::load(&self.config_path())
    }

    /// The database's own settings, without the global layer
    pub fn local_config(&self) -> CodeDbResult<CodeDbConfig> {
        CodeDbConfig::load_file(&self.config_path())
    }

    pub fn save_config(&self, config: &CodeDbConfig) -> CodeDbResult<()> {
        config.save(&self.config_path())
    }

    pub fn lock(&self, mode: LockMode) -> CodeDbResult<FileLock> {
        Ok(FileLock::acquire(&self.lock_path(), mode)?)
    }

    /// Re-indexes the source tree under the exclusive lock
    pub fn build(
        &self,
        metrics: &Metrics,
        progress: &mut dyn FnMut(&str),
    ) -> CodeDbResult<BuildSummary> {
        let config = self.config()?;
        let _lock = self.lock(LockMode::Exclusive)?;
        build_corpus(
            &self.root,
            &self.container_path(),
            &BuildOptions::from(&config),
            metrics,
            progress,
        )
    }

    /// Opens the container for searching.
    ///
    /// The returned lock must be held for as long as the reader is used.
    pub fn open_reader(&self) -> CodeDbResult<(FileLock, CorpusReader)> {
        let lock = self.lock(LockMode::Shared)?;
        let reader = CorpusReader::open(&self.container_path())?;
        Ok((lock, reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_layout() -> CodeDbResult<()> {
        let temp = TempDir::new()?;
        let db = Database::init(temp.path())?;

        assert!(db.dir().is_dir());
        assert!(db.config_path().is_file());
        assert_eq!(db.local_config()?, CodeDbConfig::default());
        Ok(())
    }

    #[test]
    fn test_init_twice_fails() -> CodeDbResult<()> {
        let temp = TempDir::new()?;
        Database::init(temp.path())?;
        assert!(matches!(
            Database::init(temp.path()),
            Err(CodeDbError::AlreadyInitialized(_))
        ));
        Ok(())
    }

    #[test]
    fn test_discover_walks_upward() -> CodeDbResult<()> {
        let temp = TempDir::new()?;
        let nested = temp.path().join("a").join("b").join("c");
        fs::create_dir_all(&nested)?;

        assert!(matches!(
            Database::discover(&nested),
            Err(CodeDbError::DatabaseNotFound(_))
        ));

        let db = Database::init(&temp.path().join("a"))?;
        let found = Database::discover(&nested)?;
        assert_eq!(found, db);
        assert_eq!(found.root(), temp.path().join("a").canonicalize()?);
        Ok(())
    }

    #[test]
    fn test_open_requires_database_dir() -> CodeDbResult<()> {
        let temp = TempDir::new()?;
        assert!(matches!(
            Database::open(temp.path()),
            Err(CodeDbError::DatabaseNotFound(_))
        ));
        Database::init(temp.path())?;
        assert!(Database::open(temp.path()).is_ok());
        Ok(())
    }

    #[test]
    fn test_build_then_open_reader() -> CodeDbResult<()> {
        let temp = TempDir::new()?;
        fs::write(temp.path().join("main.c"), "int main;\n")?;
        let db = Database::init(temp.path())?;

        let mut names = Vec::new();
        let summary = db.build(&Metrics::new(), &mut |name| names.push(name.to_string()))?;
        assert_eq!(summary.files, 1);
        assert_eq!(names, vec!["main.c".to_string()]);

        let (lock, mut reader) = db.open_reader()?;
        assert_eq!(lock.mode(), LockMode::Shared);
        assert!(reader.next_chunk()?.is_some());
        Ok(())
    }

    #[test]
    fn test_open_reader_before_build() -> CodeDbResult<()> {
        let temp = TempDir::new()?;
        let db = Database::init(temp.path())?;
        assert!(matches!(
            db.open_reader(),
            Err(CodeDbError::FileRead { .. })
        ));
        Ok(())
    }
}
