use std::io::Read;

use fastcdc::v2020::{FastCDC, StreamCDC};

use crate::config::ChunkerConfig;
use crate::error::{CaissonError, Result};

/// Split a byte slice into content-defined blocks using FastCDC.
/// Returns `(offset, length)` pairs covering the whole input in order.
///
/// Boundaries depend on content, so inserting or appending bytes only moves
/// boundaries near the edit; blocks before it keep their offsets and hashes.
///
/// Empty input yields exactly one zero-length block, so an empty file is
/// represented the same way as any other file: by its block list.
pub fn chunk_data(data: &[u8], config: &ChunkerConfig) -> Vec<(usize, usize)> {
    if data.is_empty() {
        return vec![(0, 0)];
    }
    let chunker = FastCDC::new(data, config.min_size, config.avg_size, config.max_size);
    chunker.map(|chunk| (chunk.offset, chunk.length)).collect()
}

/// Streaming form of [`chunk_data`]: reads from `source` incrementally and
/// yields owned block payloads, so memory stays bounded by `max_size` rather
/// than the file size. Boundaries are identical to the slice form; empty
/// input yields one zero-length block.
pub fn chunk_stream<R: Read>(source: R, config: &ChunkerConfig) -> ChunkStream<R> {
    ChunkStream {
        inner: StreamCDC::new(source, config.min_size, config.avg_size, config.max_size),
        yielded: false,
        done: false,
    }
}

pub struct ChunkStream<R: Read> {
    inner: StreamCDC<R>,
    yielded: bool,
    done: bool,
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => {
                self.yielded = true;
                Some(Ok(chunk.data))
            }
            Some(Err(fastcdc::v2020::Error::IoError(e))) => {
                self.done = true;
                Some(Err(CaissonError::Io(e)))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(CaissonError::Other(format!("chunking: {e}"))))
            }
            None => {
                self.done = true;
                if self.yielded {
                    None
                } else {
                    Some(Ok(Vec::new()))
                }
            }
        }
    }
}
