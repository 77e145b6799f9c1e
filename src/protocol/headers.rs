//! Fixed-layout UDP media headers
//!
//! Video datagrams carry a 24-byte header, audio datagrams a 19-byte header,
//! all fields big-endian. The relay classifies a datagram by parsing both
//! layouts and checking that the declared payload size matches the bytes
//! actually present; byte count alone is not trusted.

/// Video header length in bytes.
pub const VIDEO_HEADER_LEN: usize = 24;
/// Audio header length in bytes.
pub const AUDIO_HEADER_LEN: usize = 19;

/// Header of a video datagram. Payload is a JPEG frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoHeader {
    pub frame_id: u32,
    /// Wall-clock capture time in microseconds
    pub timestamp_us: u64,
    pub sequence_num: u32,
    pub width: u16,
    pub height: u16,
    pub payload_size: i32,
}

impl VideoHeader {
    /// Pack into the 24-byte wire layout.
    pub fn pack(&self) -> [u8; VIDEO_HEADER_LEN] {
        let mut buf = [0u8; VIDEO_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_us.to_be_bytes());
        buf[12..16].copy_from_slice(&self.sequence_num.to_be_bytes());
        buf[16..18].copy_from_slice(&self.width.to_be_bytes());
        buf[18..20].copy_from_slice(&self.height.to_be_bytes());
        buf[20..24].copy_from_slice(&self.payload_size.to_be_bytes());
        buf
    }

    /// Parse the header from the front of a datagram.
    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < VIDEO_HEADER_LEN {
            return None;
        }
        Some(Self {
            frame_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            timestamp_us: u64::from_be_bytes([
                data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
            ]),
            sequence_num: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            width: u16::from_be_bytes([data[16], data[17]]),
            height: u16::from_be_bytes([data[18], data[19]]),
            payload_size: i32::from_be_bytes([data[20], data[21], data[22], data[23]]),
        })
    }
}

/// Header of an audio datagram. Payload is 16-bit signed little-endian PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub audio_id: u32,
    /// Wall-clock capture time in microseconds
    pub timestamp_us: u64,
    pub sample_rate: u16,
    pub channels: u8,
    pub payload_size: i32,
}

impl AudioHeader {
    /// Pack into the 19-byte wire layout.
    pub fn pack(&self) -> [u8; AUDIO_HEADER_LEN] {
        let mut buf = [0u8; AUDIO_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.audio_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_us.to_be_bytes());
        buf[12..14].copy_from_slice(&self.sample_rate.to_be_bytes());
        buf[14] = self.channels;
        buf[15..19].copy_from_slice(&self.payload_size.to_be_bytes());
        buf
    }

    /// Parse the header from the front of a datagram.
    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < AUDIO_HEADER_LEN {
            return None;
        }
        Some(Self {
            audio_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            timestamp_us: u64::from_be_bytes([
                data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
            ]),
            sample_rate: u16::from_be_bytes([data[12], data[13]]),
            channels: data[14],
            payload_size: i32::from_be_bytes([data[15], data[16], data[17], data[18]]),
        })
    }
}

/// Media datagram kinds recognized by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Classify a datagram by payload-length validation.
///
/// A datagram is video iff the bytes after the video header match the
/// declared `payload_size`; audio likewise. Anything else is dropped by
/// the caller.
pub fn classify(data: &[u8]) -> Option<MediaKind> {
    if let Some(header) = VideoHeader::unpack(data) {
        if header.payload_size >= 0
            && data.len() - VIDEO_HEADER_LEN == header.payload_size as usize
        {
            return Some(MediaKind::Video);
        }
    }
    if let Some(header) = AudioHeader::unpack(data) {
        if header.payload_size >= 0
            && data.len() - AUDIO_HEADER_LEN == header.payload_size as usize
        {
            return Some(MediaKind::Audio);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_header_round_trip() {
        let header = VideoHeader {
            frame_id: 42,
            timestamp_us: 1_700_000_000_123_456,
            sequence_num: u32::MAX,
            width: 854,
            height: 480,
            payload_size: 31_337,
        };
        let packed = header.pack();
        assert_eq!(packed.len(), VIDEO_HEADER_LEN);
        assert_eq!(VideoHeader::unpack(&packed), Some(header));
    }

    #[test]
    fn audio_header_round_trip() {
        let header = AudioHeader {
            audio_id: 7,
            timestamp_us: 99,
            sample_rate: 44100,
            channels: 1,
            payload_size: 2048,
        };
        let packed = header.pack();
        assert_eq!(packed.len(), AUDIO_HEADER_LEN);
        assert_eq!(AudioHeader::unpack(&packed), Some(header));
    }

    #[test]
    fn classify_by_payload_validation() {
        let payload = vec![0xAB; 100];

        let mut video = VideoHeader {
            frame_id: 1,
            timestamp_us: 2,
            sequence_num: 3,
            width: 640,
            height: 360,
            payload_size: payload.len() as i32,
        }
        .pack()
        .to_vec();
        video.extend_from_slice(&payload);
        assert_eq!(classify(&video), Some(MediaKind::Video));

        let mut audio = AudioHeader {
            audio_id: 1,
            timestamp_us: 2,
            sample_rate: 44100,
            channels: 1,
            payload_size: payload.len() as i32,
        }
        .pack()
        .to_vec();
        audio.extend_from_slice(&payload);
        assert_eq!(classify(&audio), Some(MediaKind::Audio));
    }

    #[test]
    fn payload_size_mismatch_is_rejected() {
        let payload = vec![0u8; 50];
        let mut datagram = VideoHeader {
            frame_id: 1,
            timestamp_us: 2,
            sequence_num: 3,
            width: 640,
            height: 360,
            payload_size: 49, // off by one
        }
        .pack()
        .to_vec();
        datagram.extend_from_slice(&payload);
        assert_eq!(classify(&datagram), None);
    }

    #[test]
    fn negative_payload_size_is_rejected() {
        let datagram = VideoHeader {
            frame_id: 1,
            timestamp_us: 2,
            sequence_num: 3,
            width: 640,
            height: 360,
            payload_size: -24,
        }
        .pack()
        .to_vec();
        assert_eq!(classify(&datagram), None);
    }

    #[test]
    fn short_and_garbage_datagrams_are_rejected() {
        assert_eq!(classify(&[]), None);
        assert_eq!(classify(&[0u8; 10]), None);
        assert_eq!(classify(&[0xFF; 64]), None);
    }
}
