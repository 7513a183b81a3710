//! Framed codec for the client-worker channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (in-memory duplex, pipes, sockets).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Command, RequestId};

/// Upper bound on a single frame. File payloads ride inside frames, so this
/// is the effective cap on one upload or download.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: length_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// An inbound command, or what could be salvaged from a frame that failed to
/// parse as one.
///
/// A `Decoder` error terminates a `FramedRead` stream, which would kill the
/// router on the first malformed command. Parse failures are therefore
/// decoded as values: the router answers with a protocol error (naming the
/// salvaged `type`, echoing the salvaged `id`) and keeps serving.
#[derive(Debug)]
pub enum DecodedCommand {
    Command(Command),
    Invalid {
        kind: Option<String>,
        id: Option<RequestId>,
        detail: String,
    },
}

/// Worker-side decoder for the command stream.
pub struct CommandCodec {
    inner: LengthDelimitedCodec,
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandCodec {
    pub fn new() -> Self {
        Self {
            inner: length_codec(),
        }
    }
}

impl Decoder for CommandCodec {
    type Item = DecodedCommand;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };

        match serde_json::from_slice::<Command>(&bytes) {
            Ok(cmd) => Ok(Some(DecodedCommand::Command(cmd))),
            Err(e) => {
                let envelope: Option<serde_json::Value> = serde_json::from_slice(&bytes).ok();
                let kind = envelope
                    .as_ref()
                    .and_then(|v| v.get("type"))
                    .and_then(|t| t.as_str())
                    .map(String::from);
                let id = envelope
                    .as_ref()
                    .and_then(|v| v.get("id"))
                    .and_then(|i| i.as_u64())
                    .map(RequestId::new);
                Ok(Some(DecodedCommand::Invalid {
                    kind,
                    id,
                    detail: e.to_string(),
                }))
            }
        }
    }
}
