use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("end of stream")]
    EndOfStream,

    #[error("transport closed")]
    Closed,

    #[error("broken transport")]
    Broken(#[source] std::io::Error),
}

/// Byte-stream transport the connection runner is handed. All three failure
/// kinds are treated identically by the runner: unconditional close.
#[async_trait]
pub trait Transport: Send {
    async fn receive(&mut self, max_bytes: usize) -> Result<Bytes, TransportError>;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Adapts any async byte stream (e.g. a [`tokio::net::TcpStream`]) to the
/// [`Transport`] contract.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn receive(&mut self, max_bytes: usize) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::with_capacity(max_bytes);
        let n = self.stream.read_buf(&mut buf).await.map_err(map_io)?;
        if n == 0 {
            return Err(TransportError::EndOfStream);
        }
        Ok(buf.freeze())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes).await.map_err(map_io)?;
        self.stream.flush().await.map_err(map_io)
    }
}

fn map_io(err: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof => TransportError::EndOfStream,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            TransportError::Closed
        }
        _ => TransportError::Broken(err),
    }
}
