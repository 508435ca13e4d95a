//! Camera sources exposed as sequential byte readers

mod pattern;
#[cfg(all(feature = "v4l", target_os = "linux"))]
mod v4l2;

pub use pattern::TestPatternDevice;
#[cfg(all(feature = "v4l", target_os = "linux"))]
pub use v4l2::{default_device_path, V4lDevice};

use thiserror::Error;
use tracing::debug;

/// Fixed index of the capture device opened by the server
pub const CAMERA_INDEX: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("failed to read camera video: {0}")]
    DeviceRead(String),

    #[error("failed to open camera: {0}")]
    Init(String),

    #[error("camera closed")]
    Closed,
}

/// A byte-readable, closable camera.
///
/// `read` follows `std::io::Read` conventions: `Ok(0)` on a non-empty buffer
/// means end of input. Implementations are not meant to be read from more
/// than one task at a time.
pub trait CameraSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CameraError>;

    fn close(&mut self) -> Result<(), CameraError>;
}

/// Capture capabilities of a frame-producing device
pub trait FrameDevice: Send {
    /// Grabs one frame into the device's frame buffer
    fn capture(&mut self) -> Result<(), CameraError>;

    /// Most recently captured frame
    fn frame(&self) -> &[u8];

    fn release(&mut self);
}

/// Adapts a [`FrameDevice`] into a [`CameraSource`].
///
/// A frame larger than the caller's buffer is handed out across several
/// reads; the next frame is only captured once the previous one is drained.
pub struct FrameCamera<D: FrameDevice> {
    device: Option<D>,
    offset: usize,
    pending: usize,
}

impl<D: FrameDevice> FrameCamera<D> {
    pub fn new(device: D) -> Self {
        Self {
            device: Some(device),
            offset: 0,
            pending: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.device.is_none()
    }
}

impl<D: FrameDevice> CameraSource for FrameCamera<D> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CameraError> {
        let device = self.device.as_mut().ok_or(CameraError::Closed)?;

        if self.pending == 0 {
            device.capture()?;
            self.offset = 0;
            self.pending = device.frame().len();
            if self.pending == 0 {
                debug!("Camera produced an empty frame, treating as end of input");
                return Ok(0);
            }
        }

        let frame = &device.frame()[self.offset..self.offset + self.pending];
        let n = buf.len().min(frame.len());
        buf[..n].copy_from_slice(&frame[..n]);

        self.offset += n;
        self.pending -= n;

        Ok(n)
    }

    fn close(&mut self) -> Result<(), CameraError> {
        if let Some(mut device) = self.device.take() {
            device.release();
            debug!("Camera released");
        }
        Ok(())
    }
}

impl<D: FrameDevice> Drop for FrameCamera<D> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
