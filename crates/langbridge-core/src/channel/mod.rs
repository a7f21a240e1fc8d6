//! Framed message channel
//!
//! A bidirectional, message-oriented transport over any pair of byte
//! streams: subprocess stdio for backends, stdin/stdout or a socket for the
//! agent side.

mod codec;


pub use codec::{DEFAULT_MAX_FRAME_LEN, DecodeError, FrameCodec};

use crate::error::{BridgeError, BridgeResult};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Read half of a channel: a stream of `Result<T, DecodeError>` items
pub type FrameReader<R, T> = FramedRead<R, FrameCodec<T>>;

/// Write half of a channel: a sink of `T`
pub type FrameWriter<W, T> = FramedWrite<W, FrameCodec<T>>;

/// A framed channel carrying values of type `T` in both directions
pub struct FramedChannel<R, W, T> {
    reader: FrameReader<R, T>,
    writer: FrameWriter<W, T>,
}

impl<R, W, T> FramedChannel<R, W, T>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Serialize + DeserializeOwned,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_max_frame_len(reader, writer, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(reader: R, writer: W, max_frame_len: usize) -> Self {
        Self {
            reader: FramedRead::new(reader, FrameCodec::with_max_frame_len(max_frame_len)),
            writer: FramedWrite::new(writer, FrameCodec::with_max_frame_len(max_frame_len)),
        }
    }

    /// Write one complete message and flush it
    pub async fn send(&mut self, message: T) -> BridgeResult<()> {
        self.writer
            .send(message)
            .await
            .map_err(|e| BridgeError::transport(format!("write failed: {}", e)))
    }

    /// Next decoded item, or `None` once the byte stream has closed
    ///
    /// Decode errors come back as `Some(Err(..))` and the channel stays
    /// usable. An I/O error is returned as a transport error and the
    /// channel yields `None` afterwards.
    pub async fn receive(&mut self) -> Option<BridgeResult<Result<T, DecodeError>>> {
        match self.reader.next().await? {
            Ok(item) => Some(Ok(item)),
            Err(e) => Some(Err(BridgeError::transport(format!("read failed: {}", e)))),
        }
    }

    /// Split into independently owned halves
    pub fn split(self) -> (FrameReader<R, T>, FrameWriter<W, T>) {
        (self.reader, self.writer)
    }
}
