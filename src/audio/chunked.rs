//! Chunked read-through of a finished clip
//!
//! Reads the clip in fixed-size slices and reports cumulative upload
//! progress after each one. Progress is monotonic and ends at exactly 100
//! on success.

use crate::audio::capture::AudioBlob;
use crate::error::FlowError;
use crate::progress::{ProgressSink, ProgressStage};

pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Random-access byte source for a finished clip
pub trait BlobSource: Send + Sync {
    fn size(&self) -> u64;

    /// Read bytes in `start..end`. `end` never exceeds `size()`.
    fn read_slice(&self, start: u64, end: u64) -> Result<Vec<u8>, std::io::Error>;
}

impl BlobSource for AudioBlob {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_slice(&self, start: u64, end: u64) -> Result<Vec<u8>, std::io::Error> {
        let bytes = self.as_bytes();
        let range = usize::try_from(start).ok().zip(usize::try_from(end).ok());
        match range {
            Some((start, end)) if start <= end && end <= bytes.len() => {
                Ok(bytes[start..end].to_vec())
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("slice {}..{} outside {} byte clip", start, end, bytes.len()),
            )),
        }
    }
}

/// Cumulative progress percentage, rounded and capped at 100
pub fn progress_percent(loaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (loaded as f64 * 100.0 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

pub struct ChunkedProcessor {
    chunk_size: usize,
}

impl ChunkedProcessor {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read the whole clip slice by slice, reporting upload progress.
    ///
    /// Returns the number of bytes read. On a read failure the upload stage
    /// is marked errored and the walk stops.
    pub async fn walk(
        &self,
        blob: &dyn BlobSource,
        progress: &dyn ProgressSink,
    ) -> Result<u64, FlowError> {
        let total = blob.size();
        if total == 0 {
            progress.set(ProgressStage::Upload, 100, false);
            return Ok(0);
        }

        let mut loaded: u64 = 0;
        while loaded < total {
            let end = (loaded + self.chunk_size as u64).min(total);
            let chunk = match blob.read_slice(loaded, end) {
                Ok(chunk) => chunk,
                Err(e) => {
                    log::error!("Chunk read failed at {}..{}: {}", loaded, end, e);
                    progress.set(ProgressStage::Upload, 100, true);
                    return Err(FlowError::ChunkReadError(e.to_string()));
                }
            };

            loaded += chunk.len() as u64;
            if chunk.is_empty() {
                // A source that stops yielding bytes would otherwise spin forever
                progress.set(ProgressStage::Upload, 100, true);
                return Err(FlowError::ChunkReadError(format!(
                    "empty read at offset {} of {}",
                    loaded, total
                )));
            }
            progress.set(ProgressStage::Upload, progress_percent(loaded, total), false);

            tokio::task::yield_now().await;
        }

        log::debug!("Processed {} bytes in {} byte chunks", loaded, self.chunk_size);
        Ok(loaded)
    }
}

impl Default for ChunkedProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}
