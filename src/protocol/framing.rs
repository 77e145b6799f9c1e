//! Length-prefixed framing for the TCP control channel
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. Writes serialize the whole frame and issue a single
//! `write_all`; reads loop until the full length is consumed.

use super::ControlMessage;
use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};

/// Length-prefix size in bytes.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Upper bound on a single control frame. File chunks are 8 KiB of base64
/// inside a JSON envelope, so real frames stay far below this.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Framing and serialization errors.
#[derive(Debug)]
pub enum ProtocolError {
    /// Underlying socket error
    Io(io::Error),
    /// Declared length exceeds [`MAX_FRAME_LEN`]
    FrameTooLarge(usize),
    /// Frame body is not a valid control message
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "socket error: {}", e),
            ProtocolError::FrameTooLarge(len) => {
                write!(f, "frame length {} exceeds {} bytes", len, MAX_FRAME_LEN)
            }
            ProtocolError::Json(e) => write!(f, "malformed control message: {}", e),
        }
    }
}

impl Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

/// Serialize a message into a complete frame (prefix + JSON body).
pub fn encode_frame(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one message as a single atomic frame.
pub fn write_message<W: Write>(writer: &mut W, msg: &ControlMessage) -> Result<(), ProtocolError> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame)?;
    Ok(())
}

/// Read one framed message from a blocking stream.
///
/// Returns `Ok(None)` on a clean peer close at a frame boundary. A close in
/// the middle of a frame is an error.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<ControlMessage>, ProtocolError> {
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    let mut read = 0;
    while read < prefix.len() {
        let n = reader.read(&mut prefix[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-frame",
            )));
        }
        read += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let msg = serde_json::from_slice(&body)?;
    Ok(Some(msg))
}

/// Stateful decoder for framed byte streams.
///
/// Feed received bytes with [`extend`](FrameDecoder::extend) and drain
/// complete messages with [`next_message`](FrameDecoder::next_message);
/// partial frames are held across calls.
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    /// Append received bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        if self.buf.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        let total = FRAME_PREFIX_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let msg = serde_json::from_slice(&self.buf[FRAME_PREFIX_LEN..total])?;
        self.buf.drain(..total);
        Ok(Some(msg))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TARGET_EVERYONE;

    fn sample() -> ControlMessage {
        ControlMessage::Chat {
            message: "hello world".to_string(),
            target_name: TARGET_EVERYONE.to_string(),
        }
    }

    #[test]
    fn frame_round_trip() {
        let msg = sample();
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(
            &frame[..FRAME_PREFIX_LEN],
            &((frame.len() - FRAME_PREFIX_LEN) as u32).to_be_bytes()
        );

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        let decoded = decoder.next_message().unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn partial_reads() {
        let frame = encode_frame(&sample()).unwrap();
        let mut decoder = FrameDecoder::new();
        // Feed one byte at a time
        for &byte in &frame {
            decoder.extend(&[byte]);
        }
        assert_eq!(decoder.next_message().unwrap().unwrap(), sample());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let first = ControlMessage::Heartbeat { timestamp: 1.0 };
        let second = ControlMessage::Leave;
        let mut combined = encode_frame(&first).unwrap();
        combined.extend_from_slice(&encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&combined);
        assert_eq!(decoder.next_message().unwrap().unwrap(), first);
        assert_eq!(decoder.next_message().unwrap().unwrap(), second);
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_prefix() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(u32::MAX).to_be_bytes());
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn blocking_read_round_trip() {
        let mut buf = Vec::new();
        write_message(&mut buf, &sample()).unwrap();
        write_message(&mut buf, &ControlMessage::Leave).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_message(&mut cursor).unwrap().unwrap(), sample());
        assert_eq!(
            read_message(&mut cursor).unwrap().unwrap(),
            ControlMessage::Leave
        );
        // Clean close at a frame boundary
        assert!(read_message(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn mid_frame_close_is_an_error() {
        let frame = encode_frame(&sample()).unwrap();
        let mut cursor = std::io::Cursor::new(frame[..frame.len() - 2].to_vec());
        assert!(matches!(
            read_message(&mut cursor),
            Err(ProtocolError::Io(_))
        ));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let body = b"{not json}";
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::Json(_))
        ));
    }
}
