//! Per-turn chunk channels.
//!
//! Each turn owns two of these: generator text chunks flowing to the
//! synthesizer, and synthesized audio flowing to the output adapter. There is
//! exactly one writer (the session dispatcher) and one reader (the consuming
//! stage) per channel, so write order is delivery order.
//!
//! The channels are unbounded. The dispatcher must never wait on a slow
//! consumer while holding the session, and a turn's volume is bounded by a
//! single reply.
//!
//! A writer finishes a channel in one of two ways: [`ChunkWriter::complete`]
//! lets the reader drain what is buffered, [`ChunkWriter::cancel`] makes the
//! reader stop at once, discarding anything still queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::{Result, SessionError};

/// Create a connected writer/reader pair.
pub fn chunk_channel<T>() -> (ChunkWriter<T>, ChunkReader<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    (
        ChunkWriter {
            tx: Some(tx),
            cancelled: Arc::clone(&cancelled),
        },
        ChunkReader { rx, cancelled },
    )
}

/// Write half of a per-turn chunk channel.
#[derive(Debug)]
pub struct ChunkWriter<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> ChunkWriter<T> {
    /// Queue a chunk for the reader.
    ///
    /// # Errors
    ///
    /// Fails if the channel was already completed or cancelled, or the reader is gone.
    pub fn send(&self, chunk: T) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(SessionError::Channel("chunk channel already finished".to_owned()));
        };
        tx.send(chunk)
            .map_err(|_| SessionError::Channel("chunk reader dropped".to_owned()))
    }

    /// Finish normally; the reader drains buffered chunks, then sees the end.
    pub fn complete(&mut self) {
        self.tx = None;
    }

    /// Finish with cancellation; the reader stops immediately.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.tx = None;
    }

    pub fn is_finished(&self) -> bool {
        self.tx.is_none()
    }
}

/// Read half of a per-turn chunk channel.
#[derive(Debug)]
pub struct ChunkReader<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancelled: Arc<AtomicBool>,
}

impl<T> ChunkReader<T> {
    /// Next chunk, or `None` once the channel is completed or cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        if self.is_cancelled() {
            return None;
        }
        let chunk = self.rx.recv().await;
        if self.is_cancelled() {
            return None;
        }
        chunk
    }

    /// Whether the writer cancelled the channel.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn chunks_arrive_in_write_order() {
        let (mut writer, mut reader) = chunk_channel();
        for word in ["a", "b", "c"] {
            writer.send(word.to_owned()).unwrap();
        }
        writer.complete();

        let mut got = Vec::new();
        while let Some(chunk) = reader.recv().await {
            got.push(chunk);
        }
        assert_eq!(got, vec!["a", "b", "c"]);
        assert!(!reader.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_discards_buffered_chunks() {
        let (mut writer, mut reader) = chunk_channel();
        writer.send(1u32).unwrap();
        writer.send(2u32).unwrap();
        writer.cancel();

        assert_eq!(reader.recv().await, None);
        assert!(reader.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_wakes_a_blocked_reader() {
        let (mut writer, mut reader) = chunk_channel::<String>();
        let handle = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reader should wake")
            .expect("reader task");
        assert!(result.is_none());
    }

    #[test]
    fn send_after_finish_fails() {
        let (mut writer, _reader) = chunk_channel::<u8>();
        writer.complete();
        assert!(writer.is_finished());
        assert!(matches!(writer.send(1), Err(SessionError::Channel(_))));
    }

    #[test]
    fn send_to_dropped_reader_fails() {
        let (writer, reader) = chunk_channel::<u8>();
        drop(reader);
        assert!(writer.send(1).is_err());
    }
}
