//! Transport abstraction
//!
//! A connection talks to any `AsyncRead + AsyncWrite` byte stream. The
//! stream is split into a reader owned by the read task and a writer owned
//! by whoever holds the connection's write lock; writes are bounded by a
//! timeout. [`connect`] builds client sockets with socket2 so socket options
//! are set before the connect is issued.

use crate::http::h2::{Error, Result};
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

/// Byte stream a connection can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Receiving half
pub struct TransportReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl TransportReader {
    /// Read whatever is available into `buf`; `Ok(0)` means end of stream
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.inner.read_buf(buf).await
    }

    /// Like [`read_buf`](Self::read_buf) but gives up after `timeout`
    pub async fn read_buf_timeout(&mut self, buf: &mut BytesMut, timeout: Duration) -> Result<usize> {
        match tokio::time::timeout(timeout, self.inner.read_buf(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// Sending half
pub struct TransportWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    timeout: Duration,
    shut_down: bool,
}

impl TransportWriter {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write every chunk in order, then flush, as a single bounded operation.
    /// Returns the number of bytes written.
    pub async fn write_chunks(&mut self, chunks: &[Bytes]) -> Result<usize> {
        if self.shut_down {
            return Err(Error::ConnectionClosed);
        }
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let inner = &mut self.inner;
        let write = async {
            for chunk in chunks {
                inner.write_all(chunk).await?;
            }
            inner.flush().await
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(result) => {
                result?;
                trace!(bytes = total, chunks = chunks.len(), "transport write");
                Ok(total)
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Close the sending direction; further writes fail
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Err(e) = self.inner.shutdown().await {
            debug!(cause = %e, "transport shutdown failed");
        }
    }
}

/// Split a transport into its halves
pub fn split<T: Transport>(io: T, write_timeout: Duration) -> (TransportReader, TransportWriter) {
    let (read, write): (ReadHalf<T>, WriteHalf<T>) = tokio::io::split(io);
    (
        TransportReader {
            inner: Box::new(read),
        },
        TransportWriter {
            inner: Box::new(write),
            timeout: write_timeout,
            shut_down: false,
        },
    )
}

/// Open a TCP connection to `host:port`, trying each resolved address in turn
pub async fn connect(host: &str, port: u16, timeout: Duration, nodelay: bool) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(nodelay)?;
        socket.set_nonblocking(true)?;
        let socket = TcpSocket::from_std_stream(socket.into());

        match tokio::time::timeout(timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(%addr, cause = %e, "connect failed");
                last_err = Some(Error::Io(e));
            }
            Err(_) => {
                debug!(%addr, "connect timed out");
                last_err = Some(Error::Timeout);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve", host),
        ))
    }))
}
