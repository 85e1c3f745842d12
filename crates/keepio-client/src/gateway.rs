//! Block gateway interface
//!
//! Anything that can read, write and resolve blocks: the cluster client
//! itself, or a cache stacked in front of it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use keepio_common::{Locator, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Read size used when draining a block stream
const READ_CHUNK: usize = 64 * 1024;

/// Content of a block to be written
pub enum BlockContent {
    Data(Bytes),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl std::fmt::Debug for BlockContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(data) => write!(f, "Data({} bytes)", data.len()),
            Self::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl BlockContent {
    /// Drain the content into memory, returning it with its MD5 hex digest
    pub async fn into_bytes_with_hash(self) -> Result<(Bytes, String)> {
        match self {
            Self::Data(data) => {
                let hash = format!("{:x}", md5::compute(&data));
                Ok((data, hash))
            }
            Self::Reader(mut reader) => {
                let mut hasher = md5::Context::new();
                let mut out = BytesMut::new();
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.consume(&chunk[..n]);
                    out.extend_from_slice(&chunk[..n]);
                }
                Ok((out.freeze(), format!("{:x}", hasher.compute())))
            }
        }
    }
}

/// Arguments to [`KeepGateway::block_write`]
#[derive(Debug)]
pub struct BlockWriteOptions {
    pub content: BlockContent,
    /// Replicas wanted; the client's default when `None`
    pub replicas: Option<usize>,
}

impl BlockWriteOptions {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            content: BlockContent::Data(data.into()),
            replicas: None,
        }
    }

    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            content: BlockContent::Reader(Box::new(reader)),
            replicas: None,
        }
    }

    #[must_use]
    pub const fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = Some(replicas);
        self
    }
}

/// Result of a successful block write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockWriteResponse {
    pub locator: Locator,
    pub replicas: usize,
}

/// Block-level access to a storage cluster
#[async_trait]
pub trait KeepGateway: Send + Sync {
    /// Full, verified content of a block
    async fn block_read(&self, cancel: &CancellationToken, locator: &Locator) -> Result<Bytes>;

    /// Copy block bytes starting at `offset` into `buf`
    ///
    /// Returns fewer than `buf.len()` bytes only at the end of the block.
    async fn read_at(
        &self,
        cancel: &CancellationToken,
        locator: &Locator,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let data = self.block_read(cancel, locator).await?;
        Ok(copy_range(&data, buf, offset))
    }

    /// Store a block, returning its locator and the replicas achieved
    async fn block_write(
        &self,
        cancel: &CancellationToken,
        opts: BlockWriteOptions,
    ) -> Result<BlockWriteResponse>;

    /// Locator usable against this cluster's own services
    fn local_locator(&self, locator: &Locator) -> Result<Locator> {
        Ok(locator.local())
    }
}

/// Copy `data[offset..]` into `buf`, returning the byte count
pub fn copy_range(data: &[u8], buf: &mut [u8], offset: u64) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}
