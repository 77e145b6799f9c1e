//! Media seams: frame/audio sources and sinks, plus the JPEG codec
//!
//! The pipelines are written against these traits so the physical camera,
//! screen grabber, microphone and speaker stay outside the core. The crate
//! ships a deterministic test-pattern source and null sinks so the headless
//! client and the tests run without any device.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{AUDIO_CHUNK_SAMPLES, AUDIO_SAMPLE_RATE};

/// An uncompressed RGB24 image.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGB bytes, `width * height * 3` long
    pub data: Vec<u8>,
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawFrame({}x{}, {} bytes)", self.width, self.height, self.data.len())
    }
}

/// Media pipeline errors.
#[derive(Debug)]
pub enum MediaError {
    /// The capture device failed
    Capture(String),
    /// JPEG encoding failed
    Encode(String),
    /// JPEG decoding failed
    Decode(String),
    /// The playback device failed
    Playback(String),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::Capture(msg) => write!(f, "capture error: {}", msg),
            MediaError::Encode(msg) => write!(f, "encode error: {}", msg),
            MediaError::Decode(msg) => write!(f, "decode error: {}", msg),
            MediaError::Playback(msg) => write!(f, "playback error: {}", msg),
        }
    }
}

impl Error for MediaError {}

/// Yields raw frames at the device's own pace. Camera and screen grabbers
/// both implement this; the video sender is agnostic.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<RawFrame, MediaError>;
}

/// Consumes decoded frames, one latest frame per remote participant.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, source: SocketAddr, frame: &RawFrame);
}

/// Yields fixed-size chunks of 16-bit PCM at the device's own pace.
pub trait AudioSource: Send {
    /// Fill `buf` with samples; returns the number of samples written.
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<usize, MediaError>;
}

/// Consumes PCM for playback.
pub trait AudioSink: Send {
    fn play(&mut self, samples: &[i16]) -> Result<(), MediaError>;
}

/// Resize a frame to the tier resolution and compress it to JPEG.
pub fn encode_jpeg(
    frame: &RawFrame,
    width: u16,
    height: u16,
    quality: u8,
) -> Result<Vec<u8>, MediaError> {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| MediaError::Encode(format!("frame buffer does not match {}", frame)))?;
    let resized = if (frame.width, frame.height) == (width as u32, height as u32) {
        img
    } else {
        imageops::resize(&img, width as u32, height as u32, FilterType::Triangle)
    };

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(
            resized.as_raw(),
            resized.width(),
            resized.height(),
            image::ColorType::Rgb8,
        )
        .map_err(|e| MediaError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode a JPEG payload back into a raw frame.
pub fn decode_jpeg(payload: &[u8]) -> Result<RawFrame, MediaError> {
    let img = image::load_from_memory_with_format(payload, ImageFormat::Jpeg)
        .map_err(|e| MediaError::Decode(e.to_string()))?
        .to_rgb8();
    Ok(RawFrame {
        width: img.width(),
        height: img.height(),
        data: img.into_raw(),
    })
}

/// Deterministic moving-gradient frame source. The `seed` shifts the
/// pattern so multiple participants look distinct.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    seed: u32,
    counter: u32,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, seed: u32) -> Self {
        Self {
            width,
            height,
            seed,
            counter: 0,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Result<RawFrame, MediaError> {
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        let phase = self.counter.wrapping_mul(3).wrapping_add(self.seed);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push((x.wrapping_add(phase) & 0xFF) as u8);
                data.push((y.wrapping_add(phase) & 0xFF) as u8);
                data.push(((x ^ y).wrapping_add(self.seed) & 0xFF) as u8);
            }
        }
        self.counter = self.counter.wrapping_add(1);
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

/// Audio source producing silence, paced like a real capture device.
pub struct SilenceSource;

impl AudioSource for SilenceSource {
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<usize, MediaError> {
        // A device read blocks for one chunk period; emulate that
        std::thread::sleep(Duration::from_micros(
            AUDIO_CHUNK_SAMPLES as u64 * 1_000_000 / AUDIO_SAMPLE_RATE as u64,
        ));
        buf.fill(0);
        Ok(buf.len())
    }
}

/// Discards playback audio.
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn play(&mut self, _samples: &[i16]) -> Result<(), MediaError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let mut source = TestPatternSource::new(64, 48, 7);
        let frame = source.next_frame().unwrap();
        let jpeg = encode_jpeg(&frame, 64, 48, 70).unwrap();
        assert!(!jpeg.is_empty());

        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!((decoded.width, decoded.height), (64, 48));
        assert_eq!(decoded.data.len(), 64 * 48 * 3);
    }

    #[test]
    fn encode_resizes_to_target() {
        let mut source = TestPatternSource::new(320, 240, 0);
        let frame = source.next_frame().unwrap();
        let jpeg = encode_jpeg(&frame, 160, 120, 50).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!((decoded.width, decoded.height), (160, 120));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_jpeg(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_pattern_advances() {
        let mut source = TestPatternSource::new(16, 16, 1);
        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();
        assert_ne!(first.data, second.data);
    }
}
