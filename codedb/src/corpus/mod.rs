//! The on-disk container: a 4-byte format tag followed by compressed chunks,
//! each prefixed with its compressed length as a native-endian `u32`.
//!
//! ```text
//! "CDBZ" { [compressed_len:u32][snappy(chunk)] }*
//! ```
//!
//! Each record decompresses to exactly one buffer in the layout of
//! [`crate::codec`]. There is no cross-endian or cross-version guarantee.

pub mod builder;
pub mod reader;

pub use builder::{build_corpus, BuildOptions, BuildSummary};
pub use reader::{CompressedChunk, CorpusReader};

/// Format tag every container starts with
pub const CONTAINER_TAG: &[u8; 4] = b"CDBZ";
