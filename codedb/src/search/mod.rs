//! Pattern matching, per-file line scanning, and the ordered parallel engine.

pub mod engine;
pub mod matcher;
pub mod scanner;

pub use engine::{SearchEngine, SearchQuery, SearchStats};
pub use matcher::{escape, CompiledPattern, MatchStrategy, Matcher, PatternOptions};
pub use scanner::{scan_file, ConsoleFormatter, MatchFormatter, MatchInfo, MatchReceiver};
