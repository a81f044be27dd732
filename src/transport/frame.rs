//! Length-prefixed frame codec
//!
//! Every frame is a 3-byte big-endian length followed by the payload. The
//! client opens the connection with [`FRAME_HEADER`] glued to its first
//! frame. A transport message may carry part of a frame or several frames,
//! so the reader buffers until a whole frame is available.

use std::collections::VecDeque;

use super::{Transport, TransportError, TransportResult};

/// Connection header sent once by the client: magic `TW`, version 1, 0
pub const FRAME_HEADER: [u8; 4] = *b"TW\x01\x00";

/// Largest payload a 24-bit length prefix can describe
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

const LENGTH_SIZE: usize = 3;

/// Prefix `payload` with its length, optionally preceded by the header
pub fn encode_frame(payload: &[u8], with_header: bool) -> TransportResult<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }

    let header_len = if with_header { FRAME_HEADER.len() } else { 0 };
    let mut out = Vec::with_capacity(header_len + LENGTH_SIZE + payload.len());
    if with_header {
        out.extend_from_slice(&FRAME_HEADER);
    }
    let len = payload.len() as u32;
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental frame decoder
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
    expect_header: bool,
}

impl FrameReader {
    /// Reader for the client side (no header expected)
    pub fn new() -> Self {
        Self::default()
    }

    /// Reader for the service side, which must see the header first
    pub fn expecting_header() -> Self {
        FrameReader {
            buffer: Vec::new(),
            expect_header: true,
        }
    }

    /// Feed received bytes, returning every frame completed by them
    pub fn push(&mut self, data: &[u8]) -> TransportResult<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);

        if self.expect_header {
            if self.buffer.len() < FRAME_HEADER.len() {
                if !FRAME_HEADER.starts_with(&self.buffer) {
                    return Err(TransportError::InvalidHeader);
                }
                return Ok(Vec::new());
            }
            if self.buffer[..FRAME_HEADER.len()] != FRAME_HEADER {
                return Err(TransportError::InvalidHeader);
            }
            self.buffer.drain(..FRAME_HEADER.len());
            self.expect_header = false;
        }

        let mut frames = Vec::new();
        let mut offset = 0;
        while self.buffer.len() - offset >= LENGTH_SIZE {
            let b = &self.buffer[offset..offset + LENGTH_SIZE];
            let len = ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize;
            let start = offset + LENGTH_SIZE;
            if self.buffer.len() - start < len {
                break;
            }
            frames.push(self.buffer[start..start + len].to_vec());
            offset = start + len;
        }
        self.buffer.drain(..offset);

        Ok(frames)
    }

    /// Bytes buffered towards an incomplete frame
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Which end of the connection a [`FrameSocket`] is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the header with its first frame
    Client,
    /// Requires the header before the first frame
    Server,
}

/// A transport speaking whole frames
pub struct FrameSocket {
    transport: Box<dyn Transport>,
    reader: FrameReader,
    ready: VecDeque<Vec<u8>>,
    header_pending: bool,
}

impl FrameSocket {
    /// Wrap a connected transport
    pub fn new(transport: Box<dyn Transport>, role: Role) -> Self {
        let reader = match role {
            Role::Client => FrameReader::new(),
            Role::Server => FrameReader::expecting_header(),
        };
        FrameSocket {
            transport,
            reader,
            ready: VecDeque::new(),
            header_pending: role == Role::Client,
        }
    }

    /// Send one frame
    pub async fn send_frame(&mut self, payload: &[u8]) -> TransportResult<()> {
        let data = encode_frame(payload, self.header_pending)?;
        self.transport.send(&data).await?;
        self.header_pending = false;
        Ok(())
    }

    /// Receive the next complete frame
    pub async fn receive_frame(&mut self) -> TransportResult<Vec<u8>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }
            let data = self.transport.receive().await?;
            self.ready.extend(self.reader.push(&data)?);
        }
    }

    /// Whether the underlying transport is still up
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Close the underlying transport
    pub async fn close(&mut self) -> TransportResult<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;

    #[test]
    fn test_encode_prefix() {
        let frame = encode_frame(b"abc", false).unwrap();
        assert_eq!(frame, vec![0, 0, 3, b'a', b'b', b'c']);

        let frame = encode_frame(b"", true).unwrap();
        assert_eq!(frame, vec![b'T', b'W', 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_split_frame_reassembled() {
        let frame = encode_frame(b"hello world", false).unwrap();
        let mut reader = FrameReader::new();

        assert!(reader.push(&frame[..2]).unwrap().is_empty());
        assert!(reader.push(&frame[2..7]).unwrap().is_empty());
        assert_eq!(reader.push(&frame[7..]).unwrap(), vec![b"hello world".to_vec()]);
        assert_eq!(reader.pending_len(), 0);
    }

    #[test]
    fn test_coalesced_frames_split() {
        let mut data = encode_frame(b"one", false).unwrap();
        data.extend(encode_frame(b"", false).unwrap());
        data.extend(encode_frame(b"three", false).unwrap());
        data.extend_from_slice(&[0, 0]);

        let mut reader = FrameReader::new();
        let frames = reader.push(&data).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
        assert_eq!(reader.pending_len(), 2);
    }

    #[test]
    fn test_header_checked_once() {
        let data = encode_frame(b"x", true).unwrap();
        let mut reader = FrameReader::expecting_header();
        assert!(reader.push(&data[..3]).unwrap().is_empty());
        assert_eq!(reader.push(&data[3..]).unwrap(), vec![b"x".to_vec()]);

        let second = encode_frame(b"y", false).unwrap();
        assert_eq!(reader.push(&second).unwrap(), vec![b"y".to_vec()]);
    }

    #[test]
    fn test_bad_header_rejected() {
        let mut reader = FrameReader::expecting_header();
        assert!(matches!(
            reader.push(b"XX\x01\x00\x00\x00\x00"),
            Err(TransportError::InvalidHeader)
        ));

        let mut reader = FrameReader::expecting_header();
        assert!(matches!(reader.push(b"Q"), Err(TransportError::InvalidHeader)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload, false),
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_socket_pair() {
        let (a, b) = memory::create_pair();
        let mut client = FrameSocket::new(Box::new(a), Role::Client);
        let mut server = FrameSocket::new(Box::new(b), Role::Server);

        client.send_frame(b"first").await.unwrap();
        client.send_frame(b"second").await.unwrap();
        assert_eq!(server.receive_frame().await.unwrap(), b"first");
        assert_eq!(server.receive_frame().await.unwrap(), b"second");

        server.send_frame(b"reply").await.unwrap();
        assert_eq!(client.receive_frame().await.unwrap(), b"reply");
    }
}
