use std::io::Write;
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::{debug, info};

use crate::database::Database;
use crate::errors::CodeDbResult;
use crate::metrics::Metrics;
use crate::search::{
    escape, CompiledPattern, ConsoleFormatter, PatternOptions, SearchEngine, SearchQuery,
    SearchStats,
};

/// Flags of one `find` invocation
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    /// Ignore case in the patterns
    pub case_insensitive: bool,
    /// Match the patterns as literal text
    pub verbatim: bool,
    /// Search the whole database instead of the current subtree
    pub all: bool,
    /// Worker count; the configured `thread-count` when unset
    pub threads: Option<NonZeroUsize>,
}

/// Searches `db` for each pattern in turn, printing matches to `sink`.
///
/// Unless `options.all` is set, only files below `cwd` are searched and
/// their names are shown relative to it. All patterns are compiled before
/// anything is printed; each then runs as its own ordered search phase.
pub fn find<W: Write + Send>(
    db: &Database,
    cwd: &Path,
    patterns: &[String],
    options: &FindOptions,
    metrics: &Metrics,
    sink: &mut W,
) -> CodeDbResult<SearchStats> {
    let config = db.config()?;
    let pattern_options = PatternOptions {
        case_insensitive: options.case_insensitive,
        verbatim: options.verbatim,
    };
    let compiled = patterns
        .iter()
        .map(|p| CompiledPattern::compile(p, pattern_options))
        .collect::<CodeDbResult<Vec<_>>>()?;

    let prefix = if options.all {
        String::new()
    } else {
        subtree_prefix(db.root(), cwd)
    };
    let file_filter = if prefix.is_empty() {
        None
    } else {
        let filter_options = PatternOptions {
            case_insensitive: config.nocase_file_match,
            verbatim: false,
        };
        Some(CompiledPattern::compile(
            &format!("^{}", escape(&prefix)),
            filter_options,
        )?)
    };
    debug!("Restricting search to '{}'", prefix);

    let threads = options.threads.unwrap_or(config.thread_count);
    let engine = SearchEngine::new(threads, metrics.clone())?;
    let formatter = ConsoleFormatter::new(config.find_trim_ws);
    let (_lock, mut reader) = db.open_reader()?;

    let mut total = SearchStats::default();
    for pattern in &compiled {
        info!("Searching for '{}'", pattern.source());
        let mut query = SearchQuery::new(pattern).with_strip_prefix(&prefix);
        if let Some(filter) = &file_filter {
            query = query.with_file_filter(filter);
        }
        total.merge(engine.search(&mut reader, &query, &formatter, sink)?);
    }
    Ok(total)
}

/// `/`-separated path of `cwd` below `root` with a trailing `/`, or empty
/// when `cwd` is the root or lies outside it
pub fn subtree_prefix(root: &Path, cwd: &Path) -> String {
    let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
    let Ok(relative) = cwd.strip_prefix(root) else {
        return String::new();
    };

    let mut prefix = String::new();
    for component in relative.components() {
        prefix.push_str(&component.as_os_str().to_string_lossy());
        prefix.push('/');
    }
    prefix
}
