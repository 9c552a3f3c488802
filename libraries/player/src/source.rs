//! Random-access byte sources backing a loaded bag.

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A random-access view of a bag image.
///
/// Reads are issued concurrently by the prefetch pool, so implementations
/// must not rely on a shared cursor.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Total length of the underlying image in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `len` bytes starting at `offset`. Fewer bytes are
    /// returned only when the range extends past the end of the image.
    async fn read(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>>;
}

/// A bag file on disk.
///
/// The file is reopened for every read so concurrent chunk fetches never
/// contend on a seek position. The length is captured once at open time;
/// bags are immutable recordings.
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, len })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len.min(self.len.saturating_sub(offset)) as usize);
        file.take(len).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// An in-memory bag image, used by tests and small tools.
pub struct MemorySource {
    bytes: Vec<u8>,
}

impl MemorySource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    async fn read(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let start = offset.min(self.bytes.len() as u64) as usize;
        let end = offset.saturating_add(len).min(self.bytes.len() as u64) as usize;
        Ok(self.bytes[start..end].to_vec())
    }
}
