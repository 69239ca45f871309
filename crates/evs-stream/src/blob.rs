//! Sequential reads over an immutable, sliceable byte source.

use bytes::Bytes;
use tracing::debug;

use crate::error::StreamError;
use crate::stream::DuplexStream;

/// A file-like byte source that can be sliced without being consumed.
pub trait Blob: Send + Sync {
    fn len(&self) -> usize;

    /// Bytes in `start..end`, clamped to the blob's length.
    fn slice(&self, start: usize, end: usize) -> Bytes;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn clamp(len: usize, start: usize, end: usize) -> (usize, usize) {
    let end = end.min(len);
    (start.min(end), end)
}

impl Blob for Bytes {
    fn len(&self) -> usize {
        Bytes::len(self)
    }

    fn slice(&self, start: usize, end: usize) -> Bytes {
        let (start, end) = clamp(Bytes::len(self), start, end);
        Bytes::slice(self, start..end)
    }
}

impl Blob for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn slice(&self, start: usize, end: usize) -> Bytes {
        let (start, end) = clamp(Vec::len(self), start, end);
        Bytes::copy_from_slice(&self[start..end])
    }
}

/// Reads a blob front to back in caller-sized slices.
pub struct BlobReader<B> {
    blob: B,
    offset: usize,
}

impl<B: Blob> BlobReader<B> {
    pub fn new(blob: B) -> Self {
        Self { blob, offset: 0 }
    }

    /// Next slice of at most `size` bytes; `None` once the blob is exhausted.
    pub fn read(&mut self, size: usize) -> Option<Bytes> {
        let start = self.offset;
        let end = start.saturating_add(size);
        self.offset = end.min(self.blob.len());

        let chunk = self.blob.slice(start, end);
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.blob.len().saturating_sub(self.offset)
    }

    /// Write every remaining slice into `stream`, then finish it.
    pub async fn pipe(&mut self, stream: &DuplexStream) -> Result<u64, StreamError> {
        let size = stream.options().buffer_size();
        let mut total = 0u64;
        while let Some(chunk) = self.read(size) {
            total += chunk.len() as u64;
            stream.write(chunk).await?;
        }
        debug!(stream = %stream.id(), bytes = total, "blob piped");
        stream.finish();
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{Multiplexer, MuxConfig};
    use crate::stream::StreamOptions;
    use crate::testing::MockTransport;
    use crate::value::Value;
    use std::sync::Arc;

    #[test]
    fn test_reads_successive_slices() {
        let mut reader = BlobReader::new(Bytes::from_static(b"abcdefg"));
        assert_eq!(reader.read(3).unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(reader.remaining(), 4);
        assert_eq!(reader.read(3).unwrap(), Bytes::from_static(b"def"));
        assert_eq!(reader.read(3).unwrap(), Bytes::from_static(b"g"));
        assert_eq!(reader.read(3), None);
        assert_eq!(reader.read(3), None);
    }

    #[test]
    fn test_empty_blob() {
        let mut reader = BlobReader::new(Vec::new());
        assert_eq!(reader.read(16), None);
    }

    #[test]
    fn test_vec_slice_is_clamped() {
        let blob = vec![1u8, 2, 3];
        assert_eq!(Blob::slice(&blob, 1, 100), Bytes::from_static(&[2, 3]));
        assert_eq!(Blob::slice(&blob, 5, 9), Bytes::new());
    }

    #[tokio::test]
    async fn test_pipe_writes_then_finishes() {
        let transport = Arc::new(MockTransport::new());
        let mux = Multiplexer::new(transport.clone(), MuxConfig::default());
        let stream = DuplexStream::new(StreamOptions {
            allow_half_open: true,
            high_water_mark: 4,
            ..StreamOptions::default()
        });
        mux.register(&stream).unwrap();

        // Grant credit and ack every write as soon as it is sent.
        let acker = {
            let transport = transport.clone();
            let stream_id = stream.id().as_str().to_string();
            tokio::spawn(async move {
                let mut acked = 0;
                loop {
                    transport.inject(
                        "$stream-read",
                        vec![Value::from(stream_id.as_str()), Value::from(4u64)],
                    );
                    tokio::task::yield_now().await;
                    let writes: Vec<_> = transport
                        .get_sent()
                        .into_iter()
                        .filter(|e| e.event == "$stream-write")
                        .collect();
                    for write in writes.iter().skip(acked) {
                        write.args[3].as_ack().unwrap().call(Vec::new());
                    }
                    acked = writes.len();
                    if transport.get_sent().iter().any(|e| e.event == "$stream-end") {
                        return acked;
                    }
                }
            })
        };

        let mut reader = BlobReader::new(Bytes::from_static(b"0123456789"));
        let total = reader.pipe(&stream).await.unwrap();
        assert_eq!(total, 10);
        assert_eq!(acker.await.unwrap(), 3);
    }
}
