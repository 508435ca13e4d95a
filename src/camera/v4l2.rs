use v4l::{
    buffer::Type,
    io::{mmap::Stream as MmapStream, traits::CaptureStream},
    video::Capture,
    Device, Format, FourCC,
};

use super::{CameraError, FrameDevice};
use crate::config::CameraSection;
use tracing::info;

/// Gets the V4L2 device node for a camera index
pub fn default_device_path(camera_index: usize) -> String {
    format!("/dev/video{}", camera_index)
}

/// Memory-mapped V4L2 capture device
pub struct V4lDevice {
    stream: Option<MmapStream<'static>>,
    frame: Vec<u8>,
}

impl V4lDevice {
    pub fn open(camera_index: usize, config: &CameraSection) -> Result<Self, CameraError> {
        let path = default_device_path(camera_index);
        let device = Device::with_path(&path)
            .map_err(|e| CameraError::Init(format!("{}: {}", path, e)))?;

        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(config.fourcc.as_bytes());

        let fmt = Format::new(config.width, config.height, FourCC::new(&fourcc));
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| CameraError::Init(format!("set format on {}: {}", path, e)))?;
        info!(device = %path, format = %fmt, "Camera format set");

        // The mmap stream borrows the device for its whole lifetime
        let static_dev: &'static mut Device = Box::leak(Box::new(device));
        let stream = MmapStream::new(static_dev, Type::VideoCapture)
            .map_err(|e| CameraError::Init(format!("mmap stream on {}: {}", path, e)))?;

        Ok(Self {
            stream: Some(stream),
            frame: Vec::with_capacity(fmt.size as usize),
        })
    }
}

impl FrameDevice for V4lDevice {
    fn capture(&mut self) -> Result<(), CameraError> {
        let stream = self.stream.as_mut().ok_or(CameraError::Closed)?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::DeviceRead(e.to_string()))?;

        let used = (meta.bytesused as usize).min(buf.len());
        self.frame.clear();
        self.frame.extend_from_slice(&buf[..used]);
        Ok(())
    }

    fn frame(&self) -> &[u8] {
        &self.frame
    }

    fn release(&mut self) {
        self.stream = None;
        self.frame.clear();
    }
}
