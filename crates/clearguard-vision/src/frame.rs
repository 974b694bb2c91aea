//! Captured screen frames.

use std::time::Instant;
use thiserror::Error;

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame buffer is {got} bytes, expected {expected} for {width}x{height}")]
    BufferMismatch {
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },

    #[error("frame has zero dimension")]
    EmptyFrame,
}

/// One captured screen image.
///
/// Owned exclusively by the sampler until handed to the classifier,
/// then dropped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyFrame);
        }
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(FrameError::BufferMismatch {
                width,
                height,
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            captured_at: Instant::now(),
        })
    }

    pub fn rgba8(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        Self::new(width, height, PixelFormat::Rgba8, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_length_checked() {
        assert!(Frame::rgba8(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(
            Frame::rgba8(2, 2, vec![0; 15]),
            Err(FrameError::BufferMismatch { expected: 16, .. })
        ));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(
            Frame::rgba8(0, 2, vec![]),
            Err(FrameError::EmptyFrame)
        ));
    }
}
