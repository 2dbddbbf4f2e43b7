use memmap2::Mmap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use super::CONTAINER_TAG;
use crate::errors::{CodeDbError, CodeDbResult};

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

/// Sequential reader over the compressed chunks of a container.
///
/// The container is mapped read-only once; chunks are handed out as
/// [`CompressedChunk`] handles sharing that mapping, so they stay valid after
/// the cursor has moved on. `next_chunk` advances internal state and must not
/// be called concurrently; the search engine calls it under its lock.
#[derive(Debug)]
pub struct CorpusReader {
    path: PathBuf,
    data: Arc<Mmap>,
    cursor: usize,
}

impl CorpusReader {
    /// Maps the container and validates its format tag
    pub fn open(path: &Path) -> CodeDbResult<Self> {
        let file = File::open(path).map_err(|e| CodeDbError::file_read(path, e))?;
        let len = file.metadata()?.len();
        if len < CONTAINER_TAG.len() as u64 {
            return Err(CodeDbError::invalid_format(path));
        }

        // The build lock keeps writers away while the mapping is alive, and
        // builds replace the container by rename rather than in place.
        let mmap = unsafe { Mmap::map(&file) }?;
        if !mmap.starts_with(CONTAINER_TAG) {
            return Err(CodeDbError::invalid_format(path));
        }
        debug!("Opened container {} ({} bytes)", path.display(), mmap.len());

        Ok(Self {
            path: path.to_path_buf(),
            data: Arc::new(mmap),
            cursor: CONTAINER_TAG.len(),
        })
    }

    /// Moves the cursor back to the first chunk
    pub fn rewind(&mut self) {
        self.cursor = CONTAINER_TAG.len();
    }

    /// Returns the next compressed chunk, or `None` once the container is exhausted.
    ///
    /// Fewer than four bytes left means there are no more chunks. A length
    /// prefix pointing past the end of the file is a `CorruptChunk` error.
    pub fn next_chunk(&mut self) -> CodeDbResult<Option<CompressedChunk>> {
        let data = &self.data[..];
        let Some(prefix) = data.get(self.cursor..self.cursor + LEN_PREFIX) else {
            return Ok(None);
        };

        let mut bytes = [0u8; LEN_PREFIX];
        bytes.copy_from_slice(prefix);
        let size = u32::from_ne_bytes(bytes) as usize;

        let start = self.cursor + LEN_PREFIX;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                CodeDbError::corrupt_chunk(format!(
                    "chunk at offset {} of {} claims {} bytes but only {} remain",
                    self.cursor,
                    self.path.display(),
                    size,
                    data.len() - start
                ))
            })?;

        trace!("Chunk at offset {} ({} bytes)", self.cursor, size);
        self.cursor = end;
        Ok(Some(CompressedChunk::new(Arc::clone(&self.data), start..end)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the container file in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == CONTAINER_TAG.len()
    }
}

/// Compressed bytes of one chunk: a shared mapping plus a checked range
#[derive(Debug, Clone)]
pub struct CompressedChunk {
    data: Arc<Mmap>,
    range: Range<usize>,
}

impl CompressedChunk {
    fn new(data: Arc<Mmap>, range: Range<usize>) -> Self {
        assert!(range.start <= range.end && range.end <= data.len());
        Self { data, range }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }

    /// Offset of the compressed bytes within the container
    pub fn offset(&self) -> usize {
        self.range.start
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Decompresses into a chunk buffer for [`crate::codec::decode`]
    pub fn decompress(&self) -> CodeDbResult<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(self.bytes())
            .map_err(|e| {
                CodeDbError::corrupt_chunk(format!(
                    "chunk at offset {} does not decompress: {}",
                    self.offset(),
                    e
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn container(records: &[&[u8]]) -> Vec<u8> {
        let mut out = CONTAINER_TAG.to_vec();
        for record in records {
            out.extend_from_slice(&(record.len() as u32).to_ne_bytes());
            out.extend_from_slice(record);
        }
        out
    }

    #[test]
    fn test_reads_records_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, container(&[b"first", b"", b"third"])).unwrap();

        let mut reader = CorpusReader::open(&path).unwrap();
        let a = reader.next_chunk().unwrap().unwrap();
        let b = reader.next_chunk().unwrap().unwrap();
        let c = reader.next_chunk().unwrap().unwrap();
        assert!(reader.next_chunk().unwrap().is_none());
        assert!(reader.next_chunk().unwrap().is_none());

        assert_eq!(a.bytes(), b"first");
        assert_eq!(a.offset(), 8);
        assert!(b.is_empty());
        assert_eq!(c.bytes(), b"third");

        // Handles outlive further cursor movement
        reader.rewind();
        assert_eq!(reader.next_chunk().unwrap().unwrap().bytes(), b"first");
        assert_eq!(c.bytes(), b"third");
    }

    #[test]
    fn test_tag_only_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, CONTAINER_TAG).unwrap();

        let mut reader = CorpusReader::open(&path).unwrap();
        assert!(reader.is_empty());
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_invalid_tag() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");

        fs::write(&path, b"NOPE\x00\x00\x00\x00").unwrap();
        assert!(matches!(
            CorpusReader::open(&path),
            Err(CodeDbError::InvalidFormat(_))
        ));

        fs::write(&path, b"CD").unwrap();
        assert!(matches!(
            CorpusReader::open(&path),
            Err(CodeDbError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_missing_container() {
        let dir = tempdir().unwrap();
        let result = CorpusReader::open(&dir.path().join("missing"));
        assert!(matches!(result, Err(CodeDbError::FileRead { .. })));
    }

    #[test]
    fn test_truncated_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut bytes = container(&[b"whole"]);
        bytes.extend_from_slice(&100u32.to_ne_bytes());
        bytes.extend_from_slice(b"short");
        fs::write(&path, bytes).unwrap();

        let mut reader = CorpusReader::open(&path).unwrap();
        assert!(reader.next_chunk().unwrap().is_some());
        assert!(matches!(
            reader.next_chunk(),
            Err(CodeDbError::CorruptChunk(_))
        ));
    }

    #[test]
    fn test_partial_length_prefix_ends_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut bytes = container(&[b"whole"]);
        bytes.extend_from_slice(&[1, 2]);
        fs::write(&path, bytes).unwrap();

        let mut reader = CorpusReader::open(&path).unwrap();
        assert!(reader.next_chunk().unwrap().is_some());
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_decompress_failure_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, container(&[b"\xff\xff\xff\xff\xff"])).unwrap();

        let mut reader = CorpusReader::open(&path).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert!(matches!(
            chunk.decompress(),
            Err(CodeDbError::CorruptChunk(_))
        ));
    }

    #[test]
    fn test_decompress_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        let compressed = snap::raw::Encoder::new()
            .compress_vec(b"hello chunk")
            .unwrap();
        fs::write(&path, container(&[&compressed])).unwrap();

        let mut reader = CorpusReader::open(&path).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.decompress().unwrap(), b"hello chunk");
    }
}
