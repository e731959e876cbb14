//! Single-slot content pipe.
//!
//! # Responsibilities
//! - Hand a response body from exactly one producer task to one consumer
//! - Signal end-of-stream when the writer goes away
//! - Fail writes once the reader goes away
//!
//! # Design Decisions
//! - Backed by a bounded channel of one chunk: a write parks until the
//!   previous chunk has been taken
//! - Closing is tied to `Drop`, so a producer that returns early (or panics)
//!   still closes its end and the consumer observes EOF instead of hanging

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::error::PipeError;

/// Number of chunks that may sit in a pipe before the writer parks.
const PIPE_SLOTS: usize = 1;

/// Create a connected writer/reader pair.
pub fn content_pipe() -> (ContentWriter, ContentReader) {
    let (tx, rx) = mpsc::channel(PIPE_SLOTS);
    (ContentWriter { tx, written: 0 }, ContentReader { rx })
}

/// The producing end of a content pipe.
#[derive(Debug)]
pub struct ContentWriter {
    tx: mpsc::Sender<Bytes>,
    written: u64,
}

impl ContentWriter {
    /// Write one chunk, waiting for the slot to free up.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), PipeError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;
        self.tx.send(chunk).await.map_err(|_| PipeError::Closed)?;
        self.written += len;
        Ok(())
    }

    /// Write one chunk only if the slot is free right now.
    pub fn try_write(&mut self, chunk: impl Into<Bytes>) -> Result<(), PipeError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;
        self.tx.try_send(chunk).map_err(|_| PipeError::Closed)?;
        self.written += len;
        Ok(())
    }

    /// Bytes accepted by this writer so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// True once the reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the pipe, signalling end-of-stream.
    pub fn close(self) {}
}

/// The consuming end of a content pipe.
#[derive(Debug)]
pub struct ContentReader {
    rx: mpsc::Receiver<Bytes>,
}

impl ContentReader {
    /// Next chunk, or `None` once the writer has closed.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Collect the rest of the stream.
    pub async fn read_to_end(mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.rx.recv().await {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }

    /// Forward every chunk into `writer`, returning the byte count.
    pub async fn copy_to(mut self, writer: &mut ContentWriter) -> Result<u64, PipeError> {
        let mut copied = 0;
        while let Some(chunk) = self.rx.recv().await {
            copied += chunk.len() as u64;
            writer.write(chunk).await?;
        }
        Ok(copied)
    }

    /// Turn the reader into a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        futures_util::stream::unfold(self, |mut reader| async move {
            reader.read().await.map(|chunk| (chunk, reader))
        })
    }

    /// Close the pipe from the reading side; pending and future writes fail.
    pub fn close(self) {}
}
