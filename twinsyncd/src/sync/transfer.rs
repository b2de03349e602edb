use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use twinsync_core::{ElementPath, PathError, Provider, ProviderError};

const COMPARE_CHUNK: usize = 64 * 1024;
const RELAY_ROOT: &str = ".relay";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid relay path: {0}")]
    Path(#[from] PathError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("relay integrity check failed: read {expected} bytes, wrote {actual}")]
    IntegrityMismatch { expected: u64, actual: u64 },
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Provider(err) => err.is_transient(),
            TransferError::Path(_) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// Moves file bytes between providers, relaying through scratch when needed.
#[derive(Clone)]
pub struct TransferClient {
    scratch: Arc<dyn Provider>,
    limit: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new(scratch: Arc<dyn Provider>) -> Self {
        Self::with_config(scratch, TransferConfig::default())
    }

    pub fn with_config(scratch: Arc<dyn Provider>, config: TransferConfig) -> Self {
        Self {
            scratch,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
        }
    }

    /// Copies one file and returns the number of bytes that landed at `dst_path`.
    pub async fn copy_file(
        &self,
        src: &dyn Provider,
        src_path: &ElementPath,
        dst: &dyn Provider,
        dst_path: &ElementPath,
    ) -> Result<u64, TransferError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;

        if src.supports_direct_transfer() && dst.supports_direct_transfer() {
            let reader = src.read_data(src_path).await?;
            let written = dst.write_data(dst_path, reader).await?;
            debug!(from = %src_path, to = %dst_path, bytes = written, "copied directly");
            return Ok(written);
        }

        let relay = relay_path()?;
        let result = self.relay(src, src_path, dst, dst_path, &relay).await;
        if let Err(err) = self.scratch.delete(&relay).await {
            warn!(path = %relay, "failed to drop relay copy: {err}");
        }
        result
    }

    async fn relay(
        &self,
        src: &dyn Provider,
        src_path: &ElementPath,
        dst: &dyn Provider,
        dst_path: &ElementPath,
        relay: &ElementPath,
    ) -> Result<u64, TransferError> {
        let reader = src.read_data(src_path).await?;
        let staged = self.scratch.write_data(relay, reader).await?;
        let reader = self.scratch.read_data(relay).await?;
        let written = dst.write_data(dst_path, reader).await?;
        if staged != written {
            return Err(TransferError::IntegrityMismatch {
                expected: staged,
                actual: written,
            });
        }
        debug!(from = %src_path, to = %dst_path, bytes = written, "copied through scratch");
        Ok(written)
    }

    /// Byte-for-byte comparison of two files.
    pub async fn same_content(
        &self,
        left: &dyn Provider,
        left_path: &ElementPath,
        right: &dyn Provider,
        right_path: &ElementPath,
    ) -> Result<bool, TransferError> {
        let mut left = left.read_data(left_path).await?;
        let mut right = right.read_data(right_path).await?;
        let mut left_buf = vec![0u8; COMPARE_CHUNK];
        let mut right_buf = vec![0u8; COMPARE_CHUNK];
        loop {
            let left_len = fill(&mut left, &mut left_buf).await?;
            let right_len = fill(&mut right, &mut right_buf).await?;
            if left_len != right_len || left_buf[..left_len] != right_buf[..right_len] {
                return Ok(false);
            }
            if left_len == 0 {
                return Ok(true);
            }
        }
    }
}

/// Reads until `buf` is full or the stream ends.
async fn fill<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

fn relay_path() -> Result<ElementPath, PathError> {
    ElementPath::root()
        .join(RELAY_ROOT)?
        .join(&format!("{:016x}", rand::random::<u64>()))
}
