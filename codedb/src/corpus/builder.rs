use crossbeam_channel::{bounded, Receiver, Sender};
use ignore::{DirEntry, WalkBuilder};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tempfile::NamedTempFile;
use tracing::{debug, info, trace};

use super::CONTAINER_TAG;
use crate::codec::PendingChunk;
use crate::config::CodeDbConfig;
use crate::errors::{CodeDbError, CodeDbResult};
use crate::metrics::{timed, Metrics};
use crate::search::matcher::{CompiledPattern, Matcher, PatternOptions};

const READ_BUFFER_CAPACITY: usize = 65536;

/// What to index and how to batch it
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Regex a file name must fully match
    pub file_include: String,
    /// Regex a directory name must fully match to be skipped; empty skips nothing
    pub dir_exclude: String,
    /// Strip leading/trailing space and tab from every line
    pub trim_whitespace: bool,
    /// Soft cap on the uncompressed size of a chunk
    pub chunk_size: usize,
}

impl From<&CodeDbConfig> for BuildOptions {
    fn from(config: &CodeDbConfig) -> Self {
        Self {
            file_include: config.file_include.clone(),
            dir_exclude: config.dir_exclude.clone(),
            trim_whitespace: config.build_trim_ws,
            chunk_size: config.chunk_size,
        }
    }
}

/// Totals of a finished build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub files: u64,
    pub bytes: u64,
    pub chunks: u64,
}

/// Indexes the tree under `root` into a new container at `container`.
///
/// The container is assembled in a temporary file next to `container` and
/// renamed over it only once every chunk has been written, so a failed build
/// leaves the previous container in place. The caller is expected to hold the
/// exclusive build lock. `progress` receives each indexed file's name.
pub fn build_corpus(
    root: &Path,
    container: &Path,
    options: &BuildOptions,
    metrics: &Metrics,
    progress: &mut dyn FnMut(&str),
) -> CodeDbResult<BuildSummary> {
    info!("Building corpus of {} into {}", root.display(), container.display());

    let include = CompiledPattern::compile(&options.file_include, PatternOptions::default())?;
    let exclude = if options.dir_exclude.is_empty() {
        None
    } else {
        Some(CompiledPattern::compile(
            &options.dir_exclude,
            PatternOptions::default(),
        )?)
    };

    let container_dir = match container.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut temp = NamedTempFile::new_in(&container_dir)?;
    temp.write_all(CONTAINER_TAG)?;

    let (sender, receiver) = bounded::<Vec<u8>>(1);
    let writer_metrics = metrics.clone();
    let writer = thread::Builder::new()
        .name("codedb-compress".to_string())
        .spawn(move || write_chunks(temp, receiver, &writer_metrics))?;

    let mut summary = BuildSummary::default();
    let mut pending = PendingChunk::new();

    let walked = (|| -> CodeDbResult<()> {
        for entry in walk(root, &container_dir, exclude) {
            let entry = entry.map_err(walk_error)?;
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            if !include.match_whole(entry.file_name().to_string_lossy().as_bytes()) {
                trace!("Skipping {}", entry.path().display());
                continue;
            }

            let name = relative_name(root, entry.path());
            let size = append_file(entry.path(), pending.body_mut(), options.trim_whitespace)?;
            pending.finish_file(name.clone(), size);

            summary.files += 1;
            summary.bytes += size as u64;
            metrics.record_file_indexed(size as u64);
            progress(&name);

            if pending.body_len() > options.chunk_size && !send_chunk(&sender, &mut pending)? {
                // The writer hung up; its own error is reported on join
                return Ok(());
            }
        }

        if !pending.is_empty() && !send_chunk(&sender, &mut pending)? {
            debug!("Compression thread stopped before the last chunk");
        }
        Ok(())
    })();
    drop(sender);

    let written = writer
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "compression thread panicked"))?;
    walked?;
    let (temp, chunks) = written?;

    temp.as_file().sync_all()?;
    temp.persist(container).map_err(|e| CodeDbError::Io(e.error))?;

    summary.chunks = chunks;
    info!(
        "Indexed {} files ({} bytes) into {} chunks",
        summary.files, summary.bytes, summary.chunks
    );
    Ok(summary)
}

/// Hands the pending files to the compression thread as one chunk.
///
/// Returns `false` if the thread has already hung up.
fn send_chunk(sender: &Sender<Vec<u8>>, pending: &mut PendingChunk) -> CodeDbResult<bool> {
    debug!(
        "Flushing chunk of {} files ({} bytes)",
        pending.file_count(),
        pending.body_len()
    );
    Ok(sender.send(pending.take_encoded()?).is_ok())
}

/// Depth-first walk in file name order, pruning excluded directories
fn walk(
    root: &Path,
    container_dir: &Path,
    exclude: Option<CompiledPattern>,
) -> ignore::Walk {
    let container_dir = container_dir.to_path_buf();
    WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry: &DirEntry| {
            if entry.depth() == 0 || !entry.file_type().is_some_and(|ft| ft.is_dir()) {
                return true;
            }
            if entry.path() == container_dir {
                return false;
            }
            match &exclude {
                Some(re) => !re.match_whole(entry.file_name().to_string_lossy().as_bytes()),
                None => true,
            }
        })
        .build()
}

fn walk_error(err: ignore::Error) -> CodeDbError {
    let msg = err.to_string();
    CodeDbError::Io(
        err.into_io_error()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg)),
    )
}

/// Name of `path` relative to `root`, always `/` separated
fn relative_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Appends the normalized lines of `path` to `body`, returning the bytes added.
///
/// Every line ends in a single LF, including a final line that had none.
fn append_file(path: &Path, body: &mut Vec<u8>, trim: bool) -> CodeDbResult<usize> {
    let file = File::open(path).map_err(|e| CodeDbError::file_read(path, e))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);

    let start = body.len();
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| CodeDbError::file_read(path, e))?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(normalize_line(&line, trim));
        body.push(b'\n');
    }

    Ok(body.len() - start)
}

fn normalize_line(line: &[u8], trim: bool) -> &[u8] {
    let mut line = line.strip_suffix(b"\n").unwrap_or(line);
    line = line.strip_suffix(b"\r").unwrap_or(line);
    if trim {
        let is_ws = |b: &u8| matches!(b, b' ' | b'\t' | b'\r');
        let start = line.iter().position(|b| !is_ws(b)).unwrap_or(line.len());
        let end = line.iter().rposition(|b| !is_ws(b)).map_or(start, |i| i + 1);
        line = &line[start..end];
    }
    line
}

/// Compresses each received chunk and appends `[len:u32][bytes]` to the container
fn write_chunks(
    temp: NamedTempFile,
    chunks: Receiver<Vec<u8>>,
    metrics: &Metrics,
) -> CodeDbResult<(NamedTempFile, u64)> {
    let mut encoder = snap::raw::Encoder::new();
    let mut written = 0u64;
    {
        let mut out = BufWriter::new(temp.as_file());
        for chunk in chunks {
            let (compressed, elapsed) = timed(|| encoder.compress_vec(&chunk));
            let compressed = compressed
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            let len = u32::try_from(compressed.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "compressed chunk exceeds 4 GiB")
            })?;

            out.write_all(&len.to_ne_bytes())?;
            out.write_all(&compressed)?;
            written += 1;
            metrics.record_chunk_written(compressed.len() as u64, elapsed);
        }
        out.flush()?;
    }
    Ok((temp, written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;
    use crate::corpus::reader::CorpusReader;
    use std::fs;
    use tempfile::tempdir;

    fn options(include: &str, chunk_size: usize) -> BuildOptions {
        BuildOptions {
            file_include: include.to_string(),
            dir_exclude: r"(\.git|skipped)".to_string(),
            trim_whitespace: false,
            chunk_size,
        }
    }

    fn read_all(container: &Path) -> Vec<Vec<(String, String)>> {
        let mut reader = CorpusReader::open(container).unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            let raw = snap::raw::Decoder::new()
                .decompress_vec(chunk.bytes())
                .unwrap();
            chunks.push(
                decode(&raw)
                    .unwrap()
                    .map(|f| {
                        (
                            f.name.to_string(),
                            String::from_utf8(f.body.to_vec()).unwrap(),
                        )
                    })
                    .collect(),
            );
        }
        chunks
    }

    #[test]
    fn test_normalize_line() {
        assert_eq!(normalize_line(b"abc\r\n", false), b"abc");
        assert_eq!(normalize_line(b"  abc \t\n", false), b"  abc \t");
        assert_eq!(normalize_line(b"  abc \t\r\n", true), b"abc");
        assert_eq!(normalize_line(b" \t \n", true), b"");
        assert_eq!(normalize_line(b"last", false), b"last");
    }

    #[test]
    fn test_build_walks_and_filters() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("skipped")).unwrap();
        fs::write(root.join("b.c"), "int b;\r\n").unwrap();
        fs::write(root.join("a.c"), "int a;").unwrap();
        fs::write(root.join("README.md"), "int readme;\n").unwrap();
        fs::write(root.join("sub/c.h"), "int c;\n").unwrap();
        fs::write(root.join("skipped/d.c"), "int d;\n").unwrap();

        let container = dir.path().join("blob");
        let metrics = Metrics::new();
        let mut seen = Vec::new();
        let summary = build_corpus(
            &root,
            &container,
            &options(r".*\.(c|h)", 1 << 20),
            &metrics,
            &mut |name| seen.push(name.to_string()),
        )
        .unwrap();

        assert_eq!(seen, vec!["a.c", "b.c", "sub/c.h"]);
        assert_eq!(summary.files, 3);
        assert_eq!(summary.chunks, 1);
        assert_eq!(metrics.get_stats().files_indexed, 3);

        let chunks = read_all(&container);
        assert_eq!(
            chunks,
            vec![vec![
                ("a.c".to_string(), "int a;\n".to_string()),
                ("b.c".to_string(), "int b;\n".to_string()),
                ("sub/c.h".to_string(), "int c;\n".to_string()),
            ]]
        );
    }

    #[test]
    fn test_chunk_boundaries_keep_files_whole() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir_all(&root).unwrap();
        for i in 0..6 {
            fs::write(root.join(format!("f{i}.c")), "0123456789\n".repeat(3)).unwrap();
        }

        let container = dir.path().join("blob");
        let summary = build_corpus(
            &root,
            &container,
            &options(r".*\.c", 50),
            &Metrics::new(),
            &mut |_| {},
        )
        .unwrap();

        // 33 bytes per file: the cap is crossed after every second file
        assert_eq!(summary.chunks, 3);
        let chunks = read_all(&container);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 2));

        let names: Vec<_> = chunks.into_iter().flatten().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["f0.c", "f1.c", "f2.c", "f3.c", "f4.c", "f5.c"]);
    }

    #[test]
    fn test_trim_policy() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.c"), "  int a;  \n\tint b;\n").unwrap();

        let container = dir.path().join("blob");
        let mut opts = options(r".*\.c", 1 << 20);
        opts.trim_whitespace = true;
        build_corpus(&root, &container, &opts, &Metrics::new(), &mut |_| {}).unwrap();

        assert_eq!(read_all(&container)[0][0].1, "int a;\nint b;\n");
    }

    #[test]
    fn test_empty_tree_writes_tag_only() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir_all(&root).unwrap();

        let container = dir.path().join("blob");
        let summary = build_corpus(
            &root,
            &container,
            &options(r".*\.c", 1 << 20),
            &Metrics::new(),
            &mut |_| {},
        )
        .unwrap();

        assert_eq!(summary, BuildSummary::default());
        assert_eq!(fs::read(&container).unwrap(), CONTAINER_TAG);
    }

    #[test]
    fn test_invalid_include_pattern() {
        let dir = tempdir().unwrap();
        let result = build_corpus(
            dir.path(),
            &dir.path().join("blob"),
            &options("(unclosed", 1 << 20),
            &Metrics::new(),
            &mut |_| {},
        );
        assert!(matches!(result, Err(CodeDbError::InvalidPattern { .. })));
    }

    #[test]
    fn test_send_chunk_after_writer_hang_up() {
        let (sender, receiver) = bounded(1);
        let mut pending = PendingChunk::new();

        pending.push_file("a.c", b"one\n");
        assert!(send_chunk(&sender, &mut pending).unwrap());
        assert!(pending.is_empty());
        let raw = receiver.recv().unwrap();
        assert_eq!(decode(&raw).unwrap().next_file().unwrap().name, "a.c");

        drop(receiver);
        pending.push_file("b.c", b"two\n");
        assert!(!send_chunk(&sender, &mut pending).unwrap());
    }
}
