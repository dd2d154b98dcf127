use bytes::BytesMut;
use thiserror::Error;

use crate::Message;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unsupported message kind: {0}")]
    Unsupported(String),
}

/// Streaming encoder/decoder for the milter wire format.
///
/// `read_from` is restartable: it consumes the bytes of every message it can
/// recognize and returns `Ok(None)` once only a partial trailing message
/// remains in `buf`, leaving those bytes in place for the next call.
pub trait MessageCodec: Send {
    fn read_from(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, CodecError>;

    /// Appends the serialized form of `message` to `buf`.
    fn write_to(&mut self, buf: &mut BytesMut, message: &Message) -> Result<(), CodecError>;
}
