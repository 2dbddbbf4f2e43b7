pub mod codec;
pub mod config;
pub mod corpus;
pub mod database;
pub mod errors;
pub mod find;
pub mod lock;
pub mod metrics;
pub mod search;

pub use config::CodeDbConfig;
pub use corpus::{build_corpus, BuildOptions, BuildSummary, CorpusReader};
pub use database::Database;
pub use errors::{CodeDbError, CodeDbResult};
pub use find::{find, FindOptions};
pub use lock::{FileLock, LockMode};
pub use metrics::Metrics;
pub use search::{CompiledPattern, PatternOptions, SearchEngine, SearchQuery, SearchStats};
