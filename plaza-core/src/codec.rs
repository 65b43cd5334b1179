//! Wire codec for Plaza sockets.
//!
//! One socket carries two newline-delimited frame shapes:
//! - a full JSON envelope object per line;
//! - a raw stream frame `#<stream_id>#<payload>`, which bypasses JSON
//!   entirely — the gateway never inspects the payload bytes.
//!
//! Malformed lines decode to [`Frame::Malformed`] instead of failing the
//! codec, so the connection survives and the gateway can count offenders
//! against a rate threshold. Oversized lines are discarded up to the next
//! newline.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;

/// Default maximum line length: 1 MiB.
pub const MAX_LINE_LENGTH: usize = 1_048_576;

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A full protocol envelope.
    Envelope(Envelope),
    /// A raw stream frame on the fast path.
    Stream { stream_id: String, payload: Bytes },
    /// A line that parsed as neither. The connection stays up; the gateway
    /// decides when enough is enough.
    Malformed { reason: String },
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Frame::Envelope(envelope)
    }
}

impl Frame {
    /// Build a raw stream frame.
    pub fn stream(stream_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Frame::Stream {
            stream_id: stream_id.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_line_length: usize,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self {
            max_line_length: MAX_LINE_LENGTH,
            discarding: false,
        }
    }
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            discarding: false,
        }
    }

    fn parse_line(line: &[u8]) -> Frame {
        if let Some(rest) = line.strip_prefix(b"#") {
            let Some(sep) = rest.iter().position(|&b| b == b'#') else {
                return Frame::Malformed {
                    reason: "raw frame missing closing '#'".to_string(),
                };
            };
            let stream_id = match std::str::from_utf8(&rest[..sep]) {
                Ok(id) if !id.is_empty() => id.to_string(),
                Ok(_) => {
                    return Frame::Malformed {
                        reason: "raw frame with empty stream id".to_string(),
                    }
                }
                Err(_) => {
                    return Frame::Malformed {
                        reason: "raw frame stream id is not UTF-8".to_string(),
                    }
                }
            };
            return Frame::Stream {
                stream_id,
                payload: Bytes::copy_from_slice(&rest[sep + 1..]),
            };
        }

        match serde_json::from_slice::<Envelope>(line) {
            Ok(envelope) => Frame::Envelope(envelope),
            Err(err) => Frame::Malformed {
                reason: format!("envelope parse error: {err}"),
            },
        }
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let newline = src.iter().position(|&b| b == b'\n');

            if self.discarding {
                match newline {
                    Some(offset) => {
                        let _ = src.split_to(offset + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            match newline {
                Some(offset) if offset > self.max_line_length => {
                    let _ = src.split_to(offset + 1);
                    return Ok(Some(Frame::Malformed {
                        reason: format!("line exceeds {} bytes", self.max_line_length),
                    }));
                }
                Some(offset) => {
                    let mut line = src.split_to(offset + 1);
                    line.truncate(offset);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(Self::parse_line(&line)));
                }
                None if src.len() > self.max_line_length => {
                    src.clear();
                    self.discarding = true;
                    return Ok(Some(Frame::Malformed {
                        reason: format!("line exceeds {} bytes", self.max_line_length),
                    }));
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        match item {
            Frame::Envelope(envelope) => {
                let json = serde_json::to_vec(&envelope)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if json.len() > self.max_line_length {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("envelope exceeds {} bytes", self.max_line_length),
                    ));
                }
                dst.reserve(json.len() + 1);
                dst.put_slice(&json);
                dst.put_u8(b'\n');
            }
            Frame::Stream { stream_id, payload } => {
                if payload.iter().any(|&b| b == b'\n') {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "stream frame payload may not contain a newline",
                    ));
                }
                dst.reserve(stream_id.len() + payload.len() + 3);
                dst.put_u8(b'#');
                dst.put_slice(stream_id.as_bytes());
                dst.put_u8(b'#');
                dst.put_slice(&payload);
                dst.put_u8(b'\n');
            }
            Frame::Malformed { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "malformed frames are not encodable",
                ));
            }
        }
        Ok(())
    }
}
