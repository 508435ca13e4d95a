//! Single blocking reader that drains a camera source into a channel

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::camera::{CameraError, CameraSource};

/// Outcome of one read from the source. `Ok` chunks are never empty; the
/// channel closing after the last `Ok` means end of input.
pub type Chunk = Result<Bytes, CameraError>;

/// Moves `source` onto a blocking thread and forwards everything it yields.
///
/// The reader stops at end of input, on the first source error (which is
/// forwarded), or when the receiver is dropped. The source is closed in
/// every case. `depth` bounds the chunks in flight, so a slow consumer
/// throttles the reader instead of losing data.
pub fn spawn_reader(
    mut source: Box<dyn CameraSource>,
    chunk_size: usize,
    depth: usize,
) -> mpsc::Receiver<Chunk> {
    let (tx, rx) = mpsc::channel(depth);

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; chunk_size];
        let mut total = 0u64;

        loop {
            match source.read(&mut buf) {
                Ok(0) => {
                    info!(bytes = total, "Camera source reached end of input");
                    break;
                }
                Ok(n) => {
                    total += n as u64;
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        debug!(bytes = total, "Chunk receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Camera source read failed");
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }

        if let Err(e) = source.close() {
            warn!(error = %e, "Failed to close camera source");
        }
    });

    rx
}
