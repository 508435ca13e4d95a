//! Synthetic capture device for running without camera hardware

use super::{CameraError, FrameDevice};
use std::time::{Duration, Instant};

/// Produces frames whose bytes continue a wrapping counter from one frame
/// to the next, paced at a fixed frame interval.
pub struct TestPatternDevice {
    frame: Vec<u8>,
    next: u8,
    interval: Duration,
    last_capture: Option<Instant>,
}

impl TestPatternDevice {
    pub fn new(frame_size: usize, interval: Duration) -> Self {
        Self {
            frame: vec![0; frame_size],
            next: 0,
            interval,
            last_capture: None,
        }
    }
}

impl FrameDevice for TestPatternDevice {
    fn capture(&mut self) -> Result<(), CameraError> {
        if let Some(last) = self.last_capture {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last_capture = Some(Instant::now());

        for byte in self.frame.iter_mut() {
            *byte = self.next;
            self.next = self.next.wrapping_add(1);
        }

        Ok(())
    }

    fn frame(&self) -> &[u8] {
        &self.frame
    }

    fn release(&mut self) {
        self.frame = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSource, FrameCamera};

    #[test]
    fn test_counter_continues_across_frames() {
        let mut device = TestPatternDevice::new(3, Duration::ZERO);

        device.capture().unwrap();
        assert_eq!(device.frame(), &[0, 1, 2]);
        device.capture().unwrap();
        assert_eq!(device.frame(), &[3, 4, 5]);
    }

    #[test]
    fn test_counter_wraps() {
        let mut device = TestPatternDevice::new(300, Duration::ZERO);
        device.capture().unwrap();

        let frame = device.frame();
        assert_eq!(frame[255], 255);
        assert_eq!(frame[256], 0);
    }

    #[test]
    fn test_capture_is_paced() {
        let mut device = TestPatternDevice::new(1, Duration::from_millis(20));
        let start = Instant::now();

        for _ in 0..3 {
            device.capture().unwrap();
        }

        // The first capture is immediate, the next two wait one interval each
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_adapter_yields_contiguous_bytes() {
        let mut camera = FrameCamera::new(TestPatternDevice::new(10, Duration::ZERO));
        let mut out = Vec::new();
        let mut buf = [0u8; 4];

        while out.len() < 25 {
            let n = camera.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }

        for pair in out.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }
}
