use memchr::{memchr, memchr_iter, memrchr};
use std::ops::Range;
use tracing::trace;

use super::matcher::Matcher;
use crate::codec::DecodedFile;

/// A reported match, with every offset relative to the chunk buffer
#[derive(Debug, Clone)]
pub struct MatchInfo<'a> {
    /// Name shown to the user
    pub display_name: &'a str,
    /// Indexed name, relative to the database root
    pub full_name: &'a str,
    /// The decompressed chunk the match was found in
    pub buffer: &'a [u8],
    /// Body of the containing file
    pub file_range: Range<usize>,
    /// Containing line, including its line feed when it has one
    pub line_range: Range<usize>,
    /// Start of the match
    pub position: usize,
    /// 1-based line number within the file
    pub line: usize,
}

impl<'a> MatchInfo<'a> {
    /// The matched line without its line feed
    pub fn line_text(&self) -> &'a [u8] {
        let line = &self.buffer[self.line_range.clone()];
        line.strip_suffix(b"\n").unwrap_or(line)
    }
}

/// Consumer of matches found while scanning a file
pub trait MatchReceiver {
    /// Handles one match and returns the chunk offset to resume scanning from.
    ///
    /// Returning `info.line_range.end` reports at most one match per line.
    fn on_match(&mut self, info: &MatchInfo<'_>) -> usize;
}

/// Scans one file body line by line, calling `receiver` for every match.
///
/// Returns the number of matches reported.
pub fn scan_file<M, R>(
    buffer: &[u8],
    file: &DecodedFile<'_>,
    display_name: &str,
    pattern: &M,
    receiver: &mut R,
) -> usize
where
    M: Matcher + ?Sized,
    R: MatchReceiver + ?Sized,
{
    let base = file.offset;
    let body = &buffer[file.range()];

    let mut matches = 0;
    let mut line = 1;
    let mut cursor = 0;
    while cursor < body.len() {
        let Some(found) = pattern.find_at(body, cursor) else {
            break;
        };
        let pos = found.start;
        if pos >= body.len() {
            break;
        }

        line += memchr_iter(b'\n', &body[cursor..pos]).count();
        let line_start = memrchr(b'\n', &body[..pos]).map_or(0, |i| i + 1);
        let line_end = memchr(b'\n', &body[pos..]).map_or(body.len(), |i| pos + i + 1);

        let info = MatchInfo {
            display_name,
            full_name: file.name,
            buffer,
            file_range: file.range(),
            line_range: base + line_start..base + line_end,
            position: base + pos,
            line,
        };
        trace!("Match in {} at line {}", file.name, line);
        matches += 1;

        let resume = receiver
            .on_match(&info)
            .saturating_sub(base)
            .clamp(pos + 1, body.len());
        line += memchr_iter(b'\n', &body[pos..resume]).count();
        cursor = resume;
    }
    matches
}

/// Renders matches into the bytes a search publishes for one chunk
pub trait MatchFormatter: Sync {
    /// Appends the rendering of `info` to `out` and returns the resume offset
    fn format_match(&self, info: &MatchInfo<'_>, out: &mut Vec<u8>) -> usize;
}

/// `name:line:text` output, one line per matching line
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleFormatter {
    /// Strip leading spaces and tabs from the printed text
    pub trim_leading_whitespace: bool,
}

impl ConsoleFormatter {
    pub fn new(trim_leading_whitespace: bool) -> Self {
        Self {
            trim_leading_whitespace,
        }
    }
}

impl MatchFormatter for ConsoleFormatter {
    fn format_match(&self, info: &MatchInfo<'_>, out: &mut Vec<u8>) -> usize {
        let mut text = info.line_text();
        if self.trim_leading_whitespace {
            let skip = text
                .iter()
                .position(|&b| b != b' ' && b != b'\t')
                .unwrap_or(text.len());
            text = &text[skip..];
        }

        out.extend_from_slice(info.display_name.as_bytes());
        out.push(b':');
        out.extend_from_slice(info.line.to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(text);
        out.push(b'\n');
        info.line_range.end
    }
}

/// Receiver that renders every match into a chunk's output buffer
pub(crate) struct FormatReceiver<'a, F: ?Sized> {
    pub(crate) formatter: &'a F,
    pub(crate) out: &'a mut Vec<u8>,
}

impl<F: MatchFormatter + ?Sized> MatchReceiver for FormatReceiver<'_, F> {
    fn on_match(&mut self, info: &MatchInfo<'_>) -> usize {
        self.formatter.format_match(info, self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode, ChunkFile};
    use crate::search::matcher::{CompiledPattern, PatternOptions};

    #[derive(Default)]
    struct Collect {
        hits: Vec<(String, usize, String)>,
        every_match: bool,
    }

    impl MatchReceiver for Collect {
        fn on_match(&mut self, info: &MatchInfo<'_>) -> usize {
            self.hits.push((
                info.display_name.to_string(),
                info.line,
                String::from_utf8_lossy(info.line_text()).into_owned(),
            ));
            if self.every_match {
                info.position + 1
            } else {
                info.line_range.end
            }
        }
    }

    fn scan_all(files: &[(&str, &[u8])], pattern: &str, receiver: &mut Collect) -> usize {
        let buf = encode(files.iter().map(|&(name, body)| ChunkFile { name, body })).unwrap();
        let re = CompiledPattern::compile(pattern, PatternOptions::default()).unwrap();
        decode(&buf)
            .unwrap()
            .map(|file| scan_file(&buf, &file, file.name, &re, receiver))
            .sum()
    }

    #[test]
    fn test_reports_lines_in_order() {
        let mut rx = Collect::default();
        let count = scan_all(
            &[("a.c", b"foo\nbar\n"), ("b.c", b"baz\nfoo\n")],
            "foo",
            &mut rx,
        );
        assert_eq!(count, 2);
        assert_eq!(
            rx.hits,
            vec![
                ("a.c".to_string(), 1, "foo".to_string()),
                ("b.c".to_string(), 2, "foo".to_string()),
            ]
        );
    }

    #[test]
    fn test_one_report_per_line() {
        let mut rx = Collect::default();
        scan_all(&[("x", b"foo foo\nno\nfoo\n")], "foo", &mut rx);
        let lines: Vec<_> = rx.hits.iter().map(|h| h.1).collect();
        assert_eq!(lines, vec![1, 3]);
    }

    #[test]
    fn test_receiver_controls_resume() {
        let mut rx = Collect {
            every_match: true,
            ..Default::default()
        };
        scan_all(&[("x", b"ab ab\n\nab\n")], "ab", &mut rx);
        let lines: Vec<_> = rx.hits.iter().map(|h| h.1).collect();
        assert_eq!(lines, vec![1, 1, 3]);
    }

    #[test]
    fn test_line_anchor_at_file_start() {
        let mut rx = Collect::default();
        scan_all(&[("a", b"x\n"), ("b", b"start here\n")], "^start", &mut rx);
        assert_eq!(rx.hits, vec![("b".to_string(), 1, "start here".to_string())]);
    }

    #[test]
    fn test_final_line_without_newline() {
        let buf = b"head\nfoo tail";
        let file = DecodedFile {
            name: "t",
            body: buf,
            offset: 0,
        };
        let re = CompiledPattern::compile("tail", PatternOptions::default()).unwrap();
        let mut rx = Collect::default();
        assert_eq!(scan_file(buf, &file, "t", &re, &mut rx), 1);
        assert_eq!(rx.hits[0], ("t".to_string(), 2, "foo tail".to_string()));
    }

    #[test]
    fn test_empty_match_at_end_is_not_reported() {
        let mut rx = Collect::default();
        let count = scan_all(&[("x", b"one\ntwo\n")], "$", &mut rx);
        assert_eq!(count, 2);
        assert_eq!(rx.hits[1].1, 2);
    }

    #[test]
    fn test_empty_body() {
        let mut rx = Collect::default();
        assert_eq!(scan_all(&[("empty", b"")], "", &mut rx), 0);
    }

    #[test]
    fn test_console_formatter() {
        let buf = encode([ChunkFile {
            name: "src/lib.rs",
            body: b"fn a() {}\n\t  let x = 1;\n",
        }])
        .unwrap();
        let file = decode(&buf).unwrap().next_file().unwrap();
        let re = CompiledPattern::compile("let", PatternOptions::default()).unwrap();

        let mut out = Vec::new();
        let mut rx = FormatReceiver {
            formatter: &ConsoleFormatter::new(false),
            out: &mut out,
        };
        scan_file(&buf, &file, "lib.rs", &re, &mut rx);
        assert_eq!(out, b"lib.rs:2:\t  let x = 1;\n");

        let mut trimmed = Vec::new();
        let mut rx = FormatReceiver {
            formatter: &ConsoleFormatter::new(true),
            out: &mut trimmed,
        };
        scan_file(&buf, &file, "lib.rs", &re, &mut rx);
        assert_eq!(trimmed, b"lib.rs:2:let x = 1;\n");
    }
}
