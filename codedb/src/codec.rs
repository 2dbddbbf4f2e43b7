//! Binary codec for one chunk of the corpus.
//!
//! A decoded chunk buffer is laid out as
//!
//! ```text
//! [data_offset:u32][file_count:u32]
//! file_count x [size:u32][name_offset:u32]
//! file_count x name\0
//! file bodies, concatenated
//! ```
//!
//! All integers are native-endian `u32`. `data_offset` is the absolute offset
//! of the first body byte; it is backpatched once the name table has been
//! written. Bodies are stored back to back, so a file's start is the previous
//! file's end and only sizes need to be recorded.

use memchr::memchr;
use std::io;
use std::ops::Range;

use crate::errors::{CodeDbError, CodeDbResult};

const U32_LEN: usize = std::mem::size_of::<u32>();
const HEADER_LEN: usize = 2 * U32_LEN;
const DESCRIPTOR_LEN: usize = 2 * U32_LEN;

/// One file handed to [`encode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFile<'a> {
    pub name: &'a str,
    pub body: &'a [u8],
}

/// Files accumulated for the next chunk, bodies kept in one contiguous buffer
#[derive(Debug, Default)]
pub struct PendingChunk {
    names: Vec<String>,
    sizes: Vec<usize>,
    body: Vec<u8>,
}

impl PendingChunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a file whose body has already been written with `body_mut`
    pub fn finish_file(&mut self, name: String, size: usize) {
        debug_assert!(size <= self.body.len());
        self.names.push(name);
        self.sizes.push(size);
    }

    /// Appends a complete file
    pub fn push_file(&mut self, name: &str, body: &[u8]) {
        self.body.extend_from_slice(body);
        self.finish_file(name.to_string(), body.len());
    }

    /// Body buffer the next file's normalized lines are appended to
    pub fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    /// Accumulated body bytes
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn file_count(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Serializes the accumulated files and resets the accumulator
    pub fn take_encoded(&mut self) -> CodeDbResult<Vec<u8>> {
        let mut offset = 0;
        let files = self.names.iter().zip(&self.sizes).map(|(name, &size)| {
            let body = &self.body[offset..offset + size];
            offset += size;
            ChunkFile { name, body }
        });
        let encoded = encode(files)?;

        self.names.clear();
        self.sizes.clear();
        self.body.clear();
        Ok(encoded)
    }
}

/// Serializes an ordered list of files into one chunk buffer
pub fn encode<'a, I>(files: I) -> CodeDbResult<Vec<u8>>
where
    I: IntoIterator<Item = ChunkFile<'a>>,
{
    let files: Vec<ChunkFile<'a>> = files.into_iter().collect();

    let names_start = HEADER_LEN + files.len() * DESCRIPTOR_LEN;
    let names_len: usize = files.iter().map(|f| f.name.len() + 1).sum();
    let body_len: usize = files.iter().map(|f| f.body.len()).sum();

    let mut buf = Vec::with_capacity(names_start + names_len + body_len);
    write_u32(&mut buf, 0)?; // data_offset, patched below
    write_u32(&mut buf, files.len())?;

    let mut name_offset = names_start;
    for file in &files {
        write_u32(&mut buf, file.body.len())?;
        write_u32(&mut buf, name_offset)?;
        name_offset += file.name.len() + 1;
    }

    for file in &files {
        buf.extend_from_slice(file.name.as_bytes());
        buf.push(0);
    }

    let data_offset = buf.len();
    patch_u32(&mut buf, 0, data_offset)?;

    for file in &files {
        buf.extend_from_slice(file.body);
    }
    to_u32(buf.len())?;

    Ok(buf)
}

/// Validates a chunk buffer and returns a cursor over its files.
///
/// Every descriptor is checked before the cursor is handed out, so a corrupt
/// buffer never yields a partial list of files.
pub fn decode(buf: &[u8]) -> CodeDbResult<ChunkCursor<'_>> {
    if buf.len() < HEADER_LEN {
        return Err(CodeDbError::corrupt_chunk(format!(
            "buffer of {} bytes is shorter than the chunk header",
            buf.len()
        )));
    }

    let data_offset = read_u32(buf, 0);
    let file_count = read_u32(buf, U32_LEN);

    let names_start = file_count
        .checked_mul(DESCRIPTOR_LEN)
        .and_then(|n| n.checked_add(HEADER_LEN))
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| {
            CodeDbError::corrupt_chunk(format!(
                "descriptor table for {} files exceeds buffer of {} bytes",
                file_count,
                buf.len()
            ))
        })?;

    if data_offset < names_start || data_offset > buf.len() {
        return Err(CodeDbError::corrupt_chunk(format!(
            "data offset {} outside [{}, {}]",
            data_offset,
            names_start,
            buf.len()
        )));
    }

    let mut body_end = data_offset;
    for index in 0..file_count {
        let (size, name_offset) = descriptor(buf, index);
        name_range(buf, name_offset, names_start, data_offset)?;
        body_end = body_end
            .checked_add(size)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| {
                CodeDbError::corrupt_chunk(format!(
                    "body of file {} runs past the end of the buffer",
                    index
                ))
            })?;
    }

    Ok(ChunkCursor {
        buf,
        file_count,
        index: 0,
        offset: data_offset,
    })
}

/// One file yielded by [`ChunkCursor::next_file`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFile<'a> {
    /// Indexed name, relative to the database root
    pub name: &'a str,
    /// Normalized body
    pub body: &'a [u8],
    /// Offset of the body within the chunk buffer
    pub offset: usize,
}

impl DecodedFile<'_> {
    /// Byte range of the body within the chunk buffer
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.body.len()
    }
}

/// Walks the files of a validated chunk buffer in encoded order
#[derive(Debug, Clone)]
pub struct ChunkCursor<'a> {
    buf: &'a [u8],
    file_count: usize,
    index: usize,
    offset: usize,
}

impl<'a> ChunkCursor<'a> {
    /// Returns the next file, or `None` after `file_count` files
    pub fn next_file(&mut self) -> Option<DecodedFile<'a>> {
        if self.index == self.file_count {
            return None;
        }

        let (size, name_offset) = descriptor(self.buf, self.index);
        let names_start = HEADER_LEN + self.file_count * DESCRIPTOR_LEN;
        let data_offset = read_u32(self.buf, 0);
        let name = name_range(self.buf, name_offset, names_start, data_offset).ok()?;

        let start = self.offset;
        self.offset += size;
        self.index += 1;

        Some(DecodedFile {
            name: std::str::from_utf8(&self.buf[name]).ok()?,
            body: &self.buf[start..self.offset],
            offset: start,
        })
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    /// The whole chunk buffer the yielded offsets refer to
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }
}

impl<'a> Iterator for ChunkCursor<'a> {
    type Item = DecodedFile<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_file()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.file_count - self.index;
        (left, Some(left))
    }
}

fn descriptor(buf: &[u8], index: usize) -> (usize, usize) {
    let at = HEADER_LEN + index * DESCRIPTOR_LEN;
    (read_u32(buf, at), read_u32(buf, at + U32_LEN))
}

/// Range of a name (without its NUL) inside the name table
fn name_range(
    buf: &[u8],
    name_offset: usize,
    names_start: usize,
    data_offset: usize,
) -> CodeDbResult<Range<usize>> {
    if name_offset < names_start || name_offset >= data_offset {
        return Err(CodeDbError::corrupt_chunk(format!(
            "name offset {} outside name table [{}, {})",
            name_offset, names_start, data_offset
        )));
    }
    let len = memchr(0, &buf[name_offset..data_offset]).ok_or_else(|| {
        CodeDbError::corrupt_chunk(format!("name at {} is not terminated", name_offset))
    })?;
    let range = name_offset..name_offset + len;
    if std::str::from_utf8(&buf[range.clone()]).is_err() {
        return Err(CodeDbError::corrupt_chunk(format!(
            "name at {} is not valid UTF-8",
            name_offset
        )));
    }
    Ok(range)
}

fn read_u32(buf: &[u8], at: usize) -> usize {
    let mut bytes = [0u8; U32_LEN];
    bytes.copy_from_slice(&buf[at..at + U32_LEN]);
    u32::from_ne_bytes(bytes) as usize
}

fn to_u32(value: usize) -> CodeDbResult<u32> {
    u32::try_from(value).map_err(|_| {
        CodeDbError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk value {} does not fit in 32 bits", value),
        ))
    })
}

fn write_u32(buf: &mut Vec<u8>, value: usize) -> CodeDbResult<()> {
    buf.extend_from_slice(&to_u32(value)?.to_ne_bytes());
    Ok(())
}

fn patch_u32(buf: &mut [u8], at: usize, value: usize) -> CodeDbResult<()> {
    buf[at..at + U32_LEN].copy_from_slice(&to_u32(value)?.to_ne_bytes());
    Ok(())
}
