//! Content-Length framing codec
//!
//! Wire format: a header block of `Name: value\r\n` lines terminated by an
//! empty line, followed by exactly `Content-Length` bytes of JSON.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single frame body (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Header blocks longer than this without a terminator are malformed
const MAX_HEADER_LEN: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// A frame that could not be turned into a message
///
/// Decode errors are yielded as stream items; they never end the stream.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// Header block missing, unterminated, or without a usable length
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame was well-formed but its body is not a valid message
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Declared body length exceeds the configured maximum; body skipped
    #[error("Frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

impl DecodeError {
    /// Whether the framing itself was broken, as opposed to a single bad body
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::MalformedFrame(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Body { len: usize },
    Skip { remaining: usize },
}

/// Codec for Content-Length framed JSON values of type `T`
#[derive(Debug)]
pub struct FrameCodec<T> {
    max_frame_len: usize,
    state: DecodeState,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            state: DecodeState::Head,
            _marker: PhantomData,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_frame_len(self.max_frame_len)
    }
}

/// Parse the header block (without its terminator) into a body length
fn parse_content_length(head: &[u8]) -> Result<usize, DecodeError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| DecodeError::MalformedFrame("header block is not UTF-8".to_string()))?;

    let mut length = None;
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            DecodeError::MalformedFrame(format!("header line without ':': {:?}", line))
        })?;
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                DecodeError::MalformedFrame(format!("invalid Content-Length: {:?}", value.trim()))
            })?;
            length = Some(parsed);
        }
    }

    length.ok_or_else(|| DecodeError::MalformedFrame("missing Content-Length header".to_string()))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = Result<T, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Head => {
                    let Some(pos) = find_terminator(src) else {
                        if src.len() > MAX_HEADER_LEN {
                            src.clear();
                            return Ok(Some(Err(DecodeError::MalformedFrame(format!(
                                "no header terminator within {} bytes",
                                MAX_HEADER_LEN
                            )))));
                        }
                        return Ok(None);
                    };

                    let head = src.split_to(pos + HEADER_TERMINATOR.len());
                    let len = match parse_content_length(&head[..pos]) {
                        Ok(len) => len,
                        Err(e) => return Ok(Some(Err(e))),
                    };

                    if len > self.max_frame_len {
                        self.state = DecodeState::Skip { remaining: len };
                        return Ok(Some(Err(DecodeError::FrameTooLarge {
                            len,
                            max: self.max_frame_len,
                        })));
                    }
                    self.state = DecodeState::Body { len };
                }
                DecodeState::Body { len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    self.state = DecodeState::Head;
                    return Ok(Some(
                        serde_json::from_slice::<T>(&body)
                            .map_err(|e| DecodeError::MalformedPayload(e.to_string())),
                    ));
                }
                DecodeState::Skip { remaining } => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    if remaining > n {
                        self.state = DecodeState::Skip {
                            remaining: remaining - n,
                        };
                        return Ok(None);
                    }
                    self.state = DecodeState::Head;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }

        let truncated = match self.state {
            DecodeState::Body { .. } => true,
            DecodeState::Head => !src.is_empty(),
            DecodeState::Skip { .. } => false,
        };
        self.state = DecodeState::Head;
        src.clear();

        if truncated {
            Ok(Some(Err(DecodeError::MalformedFrame(
                "stream closed mid-frame".to_string(),
            ))))
        } else {
            Ok(None)
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}
