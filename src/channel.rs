//! Bounded chunk channel between the JPEG encoder and the upload sender
//!
//! A fixed-capacity FIFO with one producer and one consumer. Sending blocks
//! while the queue is full, so a slow network backpressures the encoder and
//! memory stays bounded by `capacity × chunk size`. The producer ends every
//! pass with exactly one [`Chunk::End`], and [`ChunkSender::finish_blocking`]
//! consumes the sender so nothing can follow it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::types::Chunk;
use crate::{CameraError, Result};

/// Default queue depth; 40 chunks of 512 bytes buffer about 20 KiB of JPEG
pub const DEFAULT_CHANNEL_CAPACITY: usize = 40;

/// Counters shared by both ends of a channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    chunks_sent: AtomicUsize,
    chunks_received: AtomicUsize,
    bytes_sent: AtomicUsize,
    bytes_received: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ChannelStats {
    /// Data chunks accepted by the channel
    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent.load(Ordering::Acquire)
    }

    /// Data chunks handed to the consumer (including drained ones)
    pub fn chunks_received(&self) -> usize {
        self.chunks_received.load(Ordering::Acquire)
    }

    /// Payload bytes accepted by the channel
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// Payload bytes handed to the consumer
    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::Acquire)
    }

    /// Highest number of queued items observed right after a send
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }
}

/// Create a channel holding at most `capacity` chunks (minimum 1)
pub fn chunk_channel(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(ChannelStats::default());

    (
        ChunkSender { tx, capacity, stats: Arc::clone(&stats) },
        ChunkReceiver { rx, stats, finished: false },
    )
}

/// Producer half
#[derive(Debug)]
pub struct ChunkSender {
    tx: mpsc::Sender<Chunk>,
    capacity: usize,
    stats: Arc<ChannelStats>,
}

impl ChunkSender {
    /// Enqueue a chunk, blocking the calling thread until a slot is free.
    ///
    /// Must not be called from inside an async task; the encoder calls it
    /// from its own blocking thread.
    pub fn send_blocking(&self, chunk: Chunk) -> Result<()> {
        let len = chunk.len();
        let is_data = !chunk.is_end();
        self.tx
            .blocking_send(chunk)
            .map_err(|_| CameraError::channel_closed("chunk consumer dropped"))?;
        if is_data {
            self.record_send(len);
        }
        Ok(())
    }

    /// Enqueue a chunk from async code, waiting for a free slot
    pub async fn send(&self, chunk: Chunk) -> Result<()> {
        let len = chunk.len();
        let is_data = !chunk.is_end();
        self.tx
            .send(chunk)
            .await
            .map_err(|_| CameraError::channel_closed("chunk consumer dropped"))?;
        if is_data {
            self.record_send(len);
        }
        Ok(())
    }

    /// Send the end-of-stream marker from a blocking thread and close this side
    pub fn finish_blocking(self) -> Result<()> {
        self.send_blocking(Chunk::End)
    }

    /// Send the end-of-stream marker from async code and close this side
    pub async fn finish(self) -> Result<()> {
        self.send(Chunk::End).await
    }

    /// Maximum number of queued chunks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }

    fn record_send(&self, len: usize) {
        self.stats.chunks_sent.fetch_add(1, Ordering::AcqRel);
        self.stats.bytes_sent.fetch_add(len, Ordering::AcqRel);
        let in_flight = self.capacity.saturating_sub(self.tx.capacity());
        self.stats.peak_in_flight.fetch_max(in_flight, Ordering::AcqRel);
    }
}

/// Consumer half
#[derive(Debug)]
pub struct ChunkReceiver {
    rx: mpsc::Receiver<Chunk>,
    stats: Arc<ChannelStats>,
    finished: bool,
}

impl ChunkReceiver {
    /// Wait for the next chunk.
    ///
    /// Returns [`Chunk::End`] once the producer has finished, and keeps
    /// returning it afterwards. A producer that vanished without sending the
    /// marker (a panicked encoder thread) is also reported as `End`, so the
    /// consumer never waits forever.
    pub async fn recv(&mut self) -> Chunk {
        if self.finished {
            return Chunk::End;
        }
        let received = self.rx.recv().await;
        self.observe(received)
    }

    /// Blocking variant of [`recv`](Self::recv) for consumers on plain threads
    pub fn blocking_recv(&mut self) -> Chunk {
        if self.finished {
            return Chunk::End;
        }
        let received = self.rx.blocking_recv();
        self.observe(received)
    }

    /// Receive and drop everything up to the end marker.
    ///
    /// Used on failure paths so the encoder never blocks on a full queue
    /// that nobody drains. Returns the number of data chunks freed.
    pub async fn drain(&mut self) -> usize {
        let mut freed = 0;
        while let Chunk::Data(bytes) = self.recv().await {
            trace!(len = bytes.len(), "Dropping undelivered chunk");
            freed += 1;
        }
        freed
    }

    /// Whether the end marker has been observed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }

    fn observe(&mut self, received: Option<Chunk>) -> Chunk {
        match received {
            Some(Chunk::Data(bytes)) => {
                self.stats.chunks_received.fetch_add(1, Ordering::AcqRel);
                self.stats.bytes_received.fetch_add(bytes.len(), Ordering::AcqRel);
                Chunk::Data(bytes)
            }
            Some(Chunk::End) => {
                self.finished = true;
                self.rx.close();
                Chunk::End
            }
            None => {
                warn!("Chunk producer exited without end-of-stream marker");
                self.finished = true;
                Chunk::End
            }
        }
    }
}
