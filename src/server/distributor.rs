//! Fan-out of camera chunks to concurrently served connections
//!
//! One reader feeds a tokio broadcast channel; every connection subscribes
//! when it starts streaming and sees the byte stream from that point on.
//! Chunks are `Bytes`, so subscribers share one allocation per chunk.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::pump::Chunk;
use crate::camera::CameraError;

/// Statistics for monitoring chunk distribution
#[derive(Debug, Clone)]
pub struct DistributionStats {
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
    pub subscribers: usize,
}

/// Broadcasts chunks to every live subscriber.
///
/// A full channel overwrites the oldest chunk; subscribers that fall that
/// far behind get [`ChunkRecvError::Lagged`] and continue with the newest
/// data instead of blocking the reader.
pub struct FrameDistributor {
    // None once closed; dropping the only sender ends every subscriber
    tx: Mutex<Option<broadcast::Sender<Bytes>>>,
    // Set before the sender is dropped when the source ended with an error
    failure: Mutex<Option<CameraError>>,
    chunks_sent: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl FrameDistributor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);

        info!(capacity, "Frame distributor created");

        Self {
            tx: Mutex::new(Some(tx)),
            failure: Mutex::new(None),
            chunks_sent: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
        }
    }

    /// Publishes a chunk to all subscribers.
    ///
    /// Returns the number of subscribers reached; with none the chunk is
    /// dropped, as a live camera does not wait for viewers.
    pub fn publish(&self, chunk: Bytes) -> usize {
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(chunk).unwrap_or(0),
            None => 0,
        };

        if sent > 0 {
            self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Subscribes a connection; `None` once the distributor is closed.
    pub fn subscribe(self: &Arc<Self>, client_id: u64) -> Option<ChunkReceiver> {
        let rx = self.tx.lock().as_ref()?.subscribe();
        debug!(client_id, subscribers = self.subscriber_count(), "Subscriber added");
        Some(ChunkReceiver {
            rx,
            distributor: Arc::clone(self),
            client_id,
            chunks_lagged: 0,
        })
    }

    /// Ends the broadcast. Subscribers drain what is buffered, then see
    /// [`ChunkRecvError::Closed`].
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("Frame distributor closed");
        }
    }

    /// Ends the broadcast because the source failed. Subscribers drain what
    /// is buffered, then see [`ChunkRecvError::Failed`].
    pub fn fail(&self, error: CameraError) {
        *self.failure.lock() = Some(error);
        self.close();
    }

    /// The source error that ended the broadcast, if any
    pub fn failure(&self) -> Option<CameraError> {
        self.failure.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, |tx| tx.receiver_count())
    }

    pub fn stats(&self) -> DistributionStats {
        DistributionStats {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Feeds a distributor from a reader channel until the reader stops, then
/// closes it. A source error fails the distributor and is returned.
pub async fn forward(
    mut chunks: mpsc::Receiver<Chunk>,
    distributor: Arc<FrameDistributor>,
) -> Result<(), CameraError> {
    let mut result = Ok(());

    while let Some(chunk) = chunks.recv().await {
        match chunk {
            Ok(bytes) => {
                distributor.publish(bytes);
            }
            Err(e) => {
                warn!(error = %e, "Camera source failed, ending all streams");
                distributor.fail(e.clone());
                result = Err(e);
                break;
            }
        }
    }

    distributor.close();

    let stats = distributor.stats();
    info!(
        sent = stats.chunks_sent,
        dropped = stats.chunks_dropped,
        "Frame distribution finished"
    );
    result
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkRecvError {
    Lagged(u64),
    /// The source reached end of input
    Closed,
    /// The source stopped with an error
    Failed(CameraError),
}

/// One connection's view of the broadcast
pub struct ChunkReceiver {
    rx: broadcast::Receiver<Bytes>,
    distributor: Arc<FrameDistributor>,
    client_id: u64,
    chunks_lagged: u64,
}

impl ChunkReceiver {
    pub async fn recv(&mut self) -> Result<Bytes, ChunkRecvError> {
        match self.rx.recv().await {
            Ok(chunk) => Ok(chunk),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.chunks_lagged += n;
                warn!(
                    client_id = self.client_id,
                    skipped = n,
                    total_skipped = self.chunks_lagged,
                    "Client lagged behind camera"
                );
                Err(ChunkRecvError::Lagged(n))
            }
            Err(broadcast::error::RecvError::Closed) => match self.distributor.failure() {
                Some(e) => Err(ChunkRecvError::Failed(e)),
                None => Err(ChunkRecvError::Closed),
            },
        }
    }

    pub fn chunks_lagged(&self) -> u64 {
        self.chunks_lagged
    }
}
