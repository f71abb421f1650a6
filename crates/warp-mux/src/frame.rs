use bytes::{BufMut, Bytes, BytesMut};

use crate::MuxError;

pub(crate) const FRAME_VERSION: u8 = 0x57;
pub(crate) const HEADER_LEN: usize = 8;

/// Largest payload carried by a single data frame. Chunks bigger than this
/// are split by the writer.
pub(crate) const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Opens a sub-stream; ids must be sequential from 1.
    Open = 1,
    /// Opaque payload bytes for one sub-stream.
    Data = 2,
    /// Flow-control credit grant; payload is a u32 BE byte count.
    Window = 3,
    Ping = 4,
    Pong = 5,
    /// Half-closes the sender's direction of one sub-stream.
    Close = 6,
    /// Shuts the whole connection down.
    GoAway = 7,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<FrameKind> {
        Some(match value {
            1 => FrameKind::Open,
            2 => FrameKind::Data,
            3 => FrameKind::Window,
            4 => FrameKind::Ping,
            5 => FrameKind::Pong,
            6 => FrameKind::Close,
            7 => FrameKind::GoAway,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub kind: FrameKind,
    pub stream: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(stream: u16) -> Frame {
        Frame {
            kind: FrameKind::Open,
            stream,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream: u16, payload: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Data,
            stream,
            payload,
        }
    }

    pub fn window(stream: u16, credit: u32) -> Frame {
        Frame {
            kind: FrameKind::Window,
            stream,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    pub fn ping() -> Frame {
        Frame {
            kind: FrameKind::Ping,
            stream: 0,
            payload: Bytes::new(),
        }
    }

    pub fn pong() -> Frame {
        Frame {
            kind: FrameKind::Pong,
            stream: 0,
            payload: Bytes::new(),
        }
    }

    pub fn close(stream: u16) -> Frame {
        Frame {
            kind: FrameKind::Close,
            stream,
            payload: Bytes::new(),
        }
    }

    pub fn goaway() -> Frame {
        Frame {
            kind: FrameKind::GoAway,
            stream: 0,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.stream);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub kind: FrameKind,
    pub stream: u16,
    pub len: u32,
}

pub(crate) fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<FrameHeader, MuxError> {
    if buf[0] != FRAME_VERSION {
        return Err(MuxError::Protocol("unsupported frame version"));
    }
    let kind = FrameKind::from_u8(buf[1]).ok_or(MuxError::Protocol("unknown frame kind"))?;
    let stream = u16::from_be_bytes([buf[2], buf[3]]);
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len as usize > MAX_FRAME_PAYLOAD {
        return Err(MuxError::Protocol("frame payload exceeds limit"));
    }
    Ok(FrameHeader { kind, stream, len })
}
