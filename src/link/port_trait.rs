//! Trait abstraction for link I/O to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Receiving half of a byte link
#[async_trait]
pub trait LinkReader: Send {
    /// Read available bytes into `buf`; `Ok(0)` means the peer closed the link
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sending half of a byte link
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkWriter: Send {
    /// Write all data, in order
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;
}

/// Adapts any tokio reader (serial half, TCP half, duplex) to [`LinkReader`]
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LinkReader for StreamReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }
}

/// Adapts any tokio writer to [`LinkWriter`]
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LinkWriter for StreamWriter<W> {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
