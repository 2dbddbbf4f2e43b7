use memchr::memchr;
use memchr::memmem::Finder;
use regex::bytes::{Regex, RegexBuilder};
use regex_syntax::hir::{Class, ClassBytes, ClassBytesRange, ClassUnicode, ClassUnicodeRange};
use regex_syntax::hir::{Hir, HirKind, Literal};
use regex_syntax::ParserBuilder;
use std::ops::Range;
use tracing::debug;

use crate::errors::{CodeDbError, CodeDbResult};

/// The capability the search engine needs from a pattern backend.
///
/// Matches never span a line feed, so callers can scan multi-line content
/// without a wildcard leaking from one line into the next.
pub trait Matcher {
    /// Anchored match against the whole of `text`
    fn match_whole(&self, text: &[u8]) -> bool;

    /// Leftmost match in `haystack` starting at or after `start`.
    ///
    /// Bytes before `start` are still visible as context for anchors and
    /// word boundaries.
    fn find_at(&self, haystack: &[u8], start: usize) -> Option<Range<usize>>;

    /// Leftmost match anywhere in `text`
    fn search(&self, text: &[u8]) -> Option<Range<usize>> {
        self.find_at(text, 0)
    }

    fn is_match(&self, text: &[u8]) -> bool {
        self.search(text).is_some()
    }
}

/// Flags applied when compiling a pattern
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternOptions {
    /// Ignore case distinctions
    pub case_insensitive: bool,
    /// Treat the pattern as literal text rather than a regex
    pub verbatim: bool,
}

/// How a compiled pattern is matched
#[derive(Debug, Clone)]
pub enum MatchStrategy {
    /// Case-sensitive literal text
    Literal(Finder<'static>),
    /// Full regex; `search` is confined to single lines and `whole` is the
    /// pattern anchored at both ends
    Regex { search: Regex, whole: Regex },
}

/// A pattern compiled once per query and shared by all search workers
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: String,
    strategy: MatchStrategy,
}

impl CompiledPattern {
    /// Compiles `pattern`, failing with `InvalidPattern` on bad syntax.
    ///
    /// `^` and `$` match at line boundaries. Nothing in the search expression
    /// matches a line feed: `.` and classes such as `\s` or `[^;]` stop at the
    /// end of the line, and a literal line feed never matches.
    pub fn compile(pattern: &str, options: PatternOptions) -> CodeDbResult<Self> {
        let strategy = if options.verbatim && !options.case_insensitive {
            MatchStrategy::Literal(Finder::new(pattern.as_bytes()).into_owned())
        } else {
            let expr = if options.verbatim {
                escape(pattern)
            } else {
                pattern.to_string()
            };
            let search = single_line_hir(&expr, options.case_insensitive)
                .map_err(|e| CodeDbError::invalid_pattern(e.to_string(), pattern))?;
            let search = RegexBuilder::new(&search.to_string())
                .build()
                .map_err(|e| CodeDbError::invalid_pattern(e.to_string(), pattern))?;
            let whole = RegexBuilder::new(&format!("^(?:{})$", expr))
                .case_insensitive(options.case_insensitive)
                .build()
                .map_err(|e| CodeDbError::invalid_pattern(e.to_string(), pattern))?;
            MatchStrategy::Regex { search, whole }
        };

        debug!("Compiled pattern '{}' as {:?}", pattern, strategy_name(&strategy));
        Ok(Self {
            source: pattern.to_string(),
            strategy,
        })
    }

    /// The pattern text as given by the caller
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn strategy(&self) -> &MatchStrategy {
        &self.strategy
    }
}

fn strategy_name(strategy: &MatchStrategy) -> &'static str {
    match strategy {
        MatchStrategy::Literal(_) => "literal",
        MatchStrategy::Regex { .. } => "regex",
    }
}

impl Matcher for CompiledPattern {
    fn match_whole(&self, text: &[u8]) -> bool {
        match &self.strategy {
            MatchStrategy::Literal(finder) => finder.needle() == text,
            MatchStrategy::Regex { whole, .. } => whole.is_match(text),
        }
    }

    fn find_at(&self, haystack: &[u8], start: usize) -> Option<Range<usize>> {
        match &self.strategy {
            MatchStrategy::Literal(finder) => {
                if memchr(b'\n', finder.needle()).is_some() {
                    return None;
                }
                let tail = haystack.get(start..)?;
                finder
                    .find(tail)
                    .map(|i| start + i..start + i + finder.needle().len())
            }
            MatchStrategy::Regex { search, .. } => {
                search.find_at(haystack, start).map(|m| m.range())
            }
        }
    }
}

/// Parses `expr` with line-oriented flags and takes the line feed out of it
fn single_line_hir(expr: &str, case_insensitive: bool) -> Result<Hir, regex_syntax::Error> {
    let hir = ParserBuilder::new()
        .utf8(false)
        .case_insensitive(case_insensitive)
        .multi_line(true)
        .dot_matches_new_line(false)
        .build()
        .parse(expr)?;
    Ok(strip_line_feed(hir))
}

/// Rewrites `hir` so that no match can contain a line feed.
///
/// The line feed is removed from every class. A literal containing one, or a
/// class left with nothing in it, becomes an expression that never matches.
fn strip_line_feed(hir: Hir) -> Hir {
    match hir.into_kind() {
        HirKind::Empty => Hir::empty(),
        HirKind::Look(look) => Hir::look(look),
        HirKind::Literal(Literal(bytes)) => {
            if memchr(b'\n', &bytes).is_some() {
                Hir::fail()
            } else {
                Hir::literal(bytes)
            }
        }
        HirKind::Class(Class::Unicode(mut class)) => {
            class.difference(&ClassUnicode::new([ClassUnicodeRange::new('\n', '\n')]));
            if class.ranges().is_empty() {
                Hir::fail()
            } else {
                Hir::class(Class::Unicode(class))
            }
        }
        HirKind::Class(Class::Bytes(mut class)) => {
            class.difference(&ClassBytes::new([ClassBytesRange::new(b'\n', b'\n')]));
            if class.ranges().is_empty() {
                Hir::fail()
            } else {
                Hir::class(Class::Bytes(class))
            }
        }
        HirKind::Repetition(mut rep) => {
            rep.sub = Box::new(strip_line_feed(*rep.sub));
            Hir::repetition(rep)
        }
        HirKind::Capture(mut cap) => {
            cap.sub = Box::new(strip_line_feed(*cap.sub));
            Hir::capture(cap)
        }
        HirKind::Concat(subs) => Hir::concat(subs.into_iter().map(strip_line_feed).collect()),
        HirKind::Alternation(subs) => {
            Hir::alternation(subs.into_iter().map(strip_line_feed).collect())
        }
    }
}

/// Escapes regex metacharacters so `text` matches literally
pub fn escape(text: &str) -> String {
    regex::escape(text)
}
