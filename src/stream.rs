//! # Buffered duplex stream
//!
//! Turns a raw byte transport into delimiter-terminated reads and queued,
//! in-order writes. Anything tokio can read from and write to works as a
//! transport, which is how the tests drive it over in-memory pipes.
//!
//! Only one read can be outstanding at a time: both [`BufferedStream::read_until`]
//! and [`BufferedStream::write`] take `&mut self`, so the borrow checker rules
//! out a second concurrent request.

use std::collections::VecDeque;

use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{Error, Result};

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug)]
pub struct BufferedStream<S> {
    inner: S,
    read_buf: Vec<u8>,
    /// Bytes at the front of `read_buf` already searched for the current
    /// delimiter
    scanned: usize,
    write_queue: VecDeque<Vec<u8>>,
    closed: bool,
}

impl<S> BufferedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S) -> Self {
        BufferedStream {
            inner,
            read_buf: Vec::with_capacity(READ_CHUNK_SIZE),
            scanned: 0,
            write_queue: VecDeque::new(),
            closed: false,
        }
    }

    /// Reads until `delimiter` has been seen and returns everything up to
    /// and including it. Bytes past the delimiter stay buffered for the
    /// next read.
    ///
    /// Queued writes are flushed before waiting on the peer. Fails with
    /// [`Error::StreamClosed`] if the peer closes before the delimiter
    /// shows up; any other I/O error closes the stream and is returned.
    pub async fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>> {
        assert!(!delimiter.is_empty(), "empty delimiter");

        if self.closed {
            return Err(Error::StreamClosed);
        }
        self.flush().await?;

        // A delimiter may straddle the previous scan boundary.
        let mut from = self.scanned.saturating_sub(delimiter.len() - 1);
        loop {
            if let Some(pos) = memmem::find(&self.read_buf[from..], delimiter)
            {
                let end = from + pos + delimiter.len();
                let chunk: Vec<u8> = self.read_buf.drain(..end).collect();
                self.scanned = 0;
                return Ok(chunk);
            }
            self.scanned = self.read_buf.len();
            from = self.scanned.saturating_sub(delimiter.len() - 1);

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = match self.inner.read(&mut chunk).await {
                Ok(0) => {
                    debug!("Peer closed the stream");
                    self.close().await;
                    return Err(Error::StreamClosed);
                }
                Ok(n) => n,
                Err(e) => {
                    self.close().await;
                    return Err(e.into());
                }
            };
            trace!("Read {} bytes", n);
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Enqueues `data` without waiting for it to reach the peer.
    pub fn queue_write(&mut self, data: &[u8]) {
        if self.closed {
            trace!("Dropping write to a closed stream");
            return;
        }
        self.write_queue.push_back(data.to_vec());
    }

    /// Enqueues `data` and resolves once it, and everything queued before
    /// it, has been flushed. Writing to a closed stream does nothing.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.queue_write(data);
        self.flush().await
    }

    /// Drains the write queue in submission order.
    pub async fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        while let Some(chunk) = self.write_queue.front() {
            if let Err(e) = self.inner.write_all(chunk).await {
                self.close().await;
                return Err(e.into());
            }
            self.write_queue.pop_front();
        }
        if let Err(e) = self.inner.flush().await {
            self.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Whether writes are still waiting to be flushed.
    pub fn writing(&self) -> bool {
        !self.write_queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the stream, discarding pending writes. Only the first call
    /// has any effect.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.write_queue.clear();
        if let Err(e) = self.inner.shutdown().await {
            trace!("Shutdown after close failed: {}", e);
        }
    }
}
