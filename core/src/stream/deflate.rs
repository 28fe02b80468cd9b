/*
 * deflate.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte, a cross-platform email client.
 *
 * Tagliacarte is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Tagliacarte is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Tagliacarte.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Raw DEFLATE duplex stream (RFC 1951 framing, no zlib header) as used by
//! IMAP COMPRESS=DEFLATE (RFC 4978).
//!
//! Reads inflate from the inner stream, writes deflate into it. `flush` does a
//! DEFLATE sync flush so everything written so far is decodable by the peer
//! straight away; `shutdown` emits the final block. One persistent
//! compression context per direction for the life of the stream.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::close::{CloseError, CloseStage, LayerCloser};

const CHUNK_SIZE: usize = 16 * 1024;

/// Compressing/decompressing wrapper over a byte stream.
pub struct DeflateStream<S> {
    inner: S,
    inflate: Inflater,
    deflate: Deflater,
}

impl<S> DeflateStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            inflate: Inflater::new(),
            deflate: Deflater::new(Compression::default()),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Drop the codec state and return the wrapped stream. Pending compressed
    /// output that was never flushed is lost; use `close` for an orderly end.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// (compressed bytes read, plain bytes produced) on the read side.
    pub fn read_totals(&self) -> (u64, u64) {
        (self.inflate.state.total_in(), self.inflate.state.total_out())
    }

    /// (plain bytes accepted, compressed bytes produced) on the write side.
    pub fn write_totals(&self) -> (u64, u64) {
        (self.deflate.state.total_in(), self.deflate.state.total_out())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> DeflateStream<S> {
    /// Close read side, then write side (final block, flush), then the inner
    /// stream. Each stage is attempted once regardless of earlier failures.
    pub async fn close(mut self) -> Result<(), CloseError> {
        let (compressed_in, plain_in) = self.read_totals();
        let (plain_out, compressed_out) = self.write_totals();
        tracing::debug!(
            compressed_in,
            plain_in,
            plain_out,
            compressed_out,
            "closing deflate stream"
        );

        let mut closer = LayerCloser::new();
        closer.attempt(CloseStage::Read, self.inflate.close());
        let inner = &mut self.inner;
        let deflate = &mut self.deflate;
        let finished = poll_fn(|cx| deflate.poll_finish(Pin::new(&mut *inner), cx)).await;
        closer.attempt(CloseStage::Write, finished);
        closer.attempt(CloseStage::Connection, self.inner.shutdown().await);
        closer.finish()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeflateStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.inflate.poll_read(Pin::new(&mut this.inner), cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeflateStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.deflate.poll_write(Pin::new(&mut this.inner), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.deflate.poll_sync(Pin::new(&mut this.inner), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.deflate.poll_finish(Pin::new(&mut this.inner), cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Read side: compressed input window plus the inflate context.
struct Inflater {
    state: Decompress,
    input: Box<[u8]>,
    start: usize,
    end: usize,
    eof: bool,
    /// Final block seen; further reads return EOF.
    done: bool,
    /// Set once the peer sent undecodable data; the stream is unusable after that.
    corrupt: Option<String>,
}

impl Inflater {
    fn new() -> Self {
        Self {
            state: Decompress::new(false),
            input: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            eof: false,
            done: false,
            corrupt: None,
        }
    }

    fn poll_read<R: AsyncRead>(
        &mut self,
        mut inner: Pin<&mut R>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(msg) = &self.corrupt {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, msg.clone())));
        }
        if self.done || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let mut need_input = self.start == self.end;
        loop {
            if need_input && !self.eof {
                if self.start > 0 {
                    self.input.copy_within(self.start..self.end, 0);
                    self.end -= self.start;
                    self.start = 0;
                }
                if self.end == self.input.len() {
                    let msg = "inflate made no progress on a full input window".to_string();
                    self.corrupt = Some(msg.clone());
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, msg)));
                }
                let mut rb = ReadBuf::new(&mut self.input[self.end..]);
                ready!(inner.as_mut().poll_read(cx, &mut rb))?;
                let n = rb.filled().len();
                if n == 0 {
                    self.eof = true;
                } else {
                    self.end += n;
                }
            }

            let flush = if self.eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let before_in = self.state.total_in();
            let before_out = self.state.total_out();
            let result = self
                .state
                .decompress(&self.input[self.start..self.end], buf.initialize_unfilled(), flush);
            let status = match result {
                Ok(s) => s,
                Err(e) => {
                    self.corrupt = Some(e.to_string());
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e)));
                }
            };
            let consumed = (self.state.total_in() - before_in) as usize;
            let produced = (self.state.total_out() - before_out) as usize;
            self.start += consumed;
            buf.advance(produced);

            if status == Status::StreamEnd {
                self.done = true;
                return Poll::Ready(Ok(()));
            }
            if produced > 0 {
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                if self.start == self.end {
                    // Peer went away without a final block: plain EOF.
                    return Poll::Ready(Ok(()));
                }
                if consumed == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated deflate stream",
                    )));
                }
                continue;
            }
            need_input = consumed == 0 || self.start == self.end;
        }
    }

    /// Release the inflate window. Reports a stream that had gone corrupt.
    fn close(&mut self) -> io::Result<()> {
        self.input = Box::new([]);
        self.start = 0;
        self.end = 0;
        self.done = true;
        self.state.reset(false);
        match self.corrupt.take() {
            Some(msg) => Err(io::Error::new(io::ErrorKind::InvalidData, msg)),
            None => Ok(()),
        }
    }
}

/// Write side: deflate context plus compressed bytes not yet accepted by the inner stream.
struct Deflater {
    state: Compress,
    output: Vec<u8>,
    pos: usize,
    /// Input accepted since the last sync flush.
    dirty: bool,
    finished: bool,
}

impl Deflater {
    fn new(level: Compression) -> Self {
        Self {
            state: Compress::new(level, false),
            output: Vec::with_capacity(CHUNK_SIZE),
            pos: 0,
            dirty: false,
            finished: false,
        }
    }

    /// Push pending compressed bytes into the inner stream.
    fn poll_drain<W: AsyncWrite>(
        &mut self,
        mut inner: Pin<&mut W>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pos < self.output.len() {
            let n = ready!(inner.as_mut().poll_write(cx, &self.output[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "inner stream accepted no compressed bytes",
                )));
            }
            self.pos += n;
        }
        self.output.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Run the compressor into the (drained) output buffer. Returns (consumed, status).
    fn compress(&mut self, input: &[u8], flush: FlushCompress) -> io::Result<(usize, Status)> {
        self.output.reserve(CHUNK_SIZE);
        let before_in = self.state.total_in();
        let status = self
            .state
            .compress_vec(input, &mut self.output, flush)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(((self.state.total_in() - before_in) as usize, status))
    }

    fn poll_write<W: AsyncWrite>(
        &mut self,
        mut inner: Pin<&mut W>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "deflate stream already finished",
            )));
        }
        ready!(self.poll_drain(inner.as_mut(), cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        loop {
            let (consumed, _) = self.compress(data, FlushCompress::None)?;
            if consumed > 0 {
                self.dirty = true;
                return Poll::Ready(Ok(consumed));
            }
            // Output filled before any input went in; make room and retry.
            ready!(self.poll_drain(inner.as_mut(), cx))?;
        }
    }

    fn poll_sync<W: AsyncWrite>(
        &mut self,
        mut inner: Pin<&mut W>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            ready!(self.poll_drain(inner.as_mut(), cx))?;
            if !self.dirty || self.finished {
                break;
            }
            self.compress(&[], FlushCompress::Sync)?;
            // The sync flush is complete once it leaves spare output space.
            if self.output.len() < self.output.capacity() {
                self.dirty = false;
            }
        }
        inner.poll_flush(cx)
    }

    fn poll_finish<W: AsyncWrite>(
        &mut self,
        mut inner: Pin<&mut W>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            ready!(self.poll_drain(inner.as_mut(), cx))?;
            if self.finished {
                break;
            }
            let (_, status) = self.compress(&[], FlushCompress::Finish)?;
            if status == Status::StreamEnd {
                self.finished = true;
                self.dirty = false;
            }
        }
        inner.poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn round_trip(data: Vec<u8>) -> Vec<u8> {
        let (a, b) = tokio::io::duplex(8 * 1024);
        let mut tx = DeflateStream::new(a);
        let mut rx = DeflateStream::new(b);
        let send = async move {
            tx.write_all(&data).await?;
            tx.flush().await?;
            tx.shutdown().await?;
            Ok::<_, io::Error>(())
        };
        let recv = async move {
            let mut out = Vec::new();
            rx.read_to_end(&mut out).await?;
            Ok::<_, io::Error>(out)
        };
        let (sent, received) = tokio::join!(send, recv);
        sent.expect("send");
        received.expect("receive")
    }

    fn sample(len: usize) -> Vec<u8> {
        // Mix of compressible text and noise.
        let mut seed: u32 = 0x9e37_79b9;
        (0..len)
            .map(|i| {
                if i % 3 == 0 {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    seed as u8
                } else {
                    b"* 1 FETCH (FLAGS (\\Seen))\r\n"[i % 27]
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn round_trip_empty() {
        assert!(round_trip(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn round_trip_single_byte() {
        assert_eq!(round_trip(vec![b'x']).await, b"x");
    }

    #[tokio::test]
    async fn round_trip_larger_than_64k() {
        let data = sample(200 * 1024);
        assert_eq!(round_trip(data.clone()).await, data);
    }

    #[tokio::test]
    async fn flush_makes_data_readable_without_closing() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = DeflateStream::new(a);
        let mut rx = DeflateStream::new(b);
        tx.write_all(b"A001 NOOP\r\n").await.unwrap();
        tx.flush().await.unwrap();
        let mut line = [0u8; 11];
        rx.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"A001 NOOP\r\n");

        tx.write_all(b"A002 LOGOUT\r\n").await.unwrap();
        tx.flush().await.unwrap();
        let mut line = [0u8; 13];
        rx.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"A002 LOGOUT\r\n");
    }

    #[tokio::test]
    async fn flush_without_writes_sends_nothing() {
        let mut tx = DeflateStream::new(Vec::<u8>::new());
        tx.flush().await.unwrap();
        assert!(tx.get_ref().is_empty());
    }

    #[tokio::test]
    async fn output_decodes_with_flate2() {
        let data = sample(70 * 1024);
        let mut tx = DeflateStream::new(Vec::<u8>::new());
        tx.write_all(&data).await.unwrap();
        tx.shutdown().await.unwrap();
        let compressed = tx.into_inner();
        assert!(compressed.len() < data.len());

        let mut decoder = flate2::read::DeflateDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn reads_flate2_output() {
        let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"* OK [COMPRESSIONACTIVE]\r\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut rx = DeflateStream::new(&compressed[..]);
        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"* OK [COMPRESSIONACTIVE]\r\n");
    }

    #[derive(Default)]
    struct Counts {
        writes: AtomicUsize,
        flushes: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    /// Stream that serves fixed input, counts calls, and can refuse writes.
    struct Probe {
        input: &'static [u8],
        fail_writes: bool,
        counts: Arc<Counts>,
    }

    impl AsyncRead for Probe {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let n = self.input.len().min(buf.remaining());
            buf.put_slice(&self.input[..n]);
            self.input = &self.input[n..];
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for Probe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.counts.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
            } else {
                Poll::Ready(Ok(buf.len()))
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.counts.flushes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.counts.shutdowns.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn corrupt_read_side_still_closes_write_side_and_connection() {
        let counts = Arc::new(Counts::default());
        // BFINAL=1, BTYPE=11 (reserved): invalid block.
        let mut stream = DeflateStream::new(Probe {
            input: &[0x07, 0x00, 0x00],
            fail_writes: false,
            counts: counts.clone(),
        });
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = stream.close().await.unwrap_err();
        assert_eq!(err.stages(), vec![CloseStage::Read]);
        assert!(counts.writes.load(Ordering::SeqCst) >= 1, "final block written");
        assert_eq!(counts.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(counts.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_write_side_still_closes_connection() {
        let counts = Arc::new(Counts::default());
        let stream = DeflateStream::new(Probe {
            input: &[],
            fail_writes: true,
            counts: counts.clone(),
        });
        let err = stream.close().await.unwrap_err();
        assert_eq!(err.stages(), vec![CloseStage::Write]);
        assert_eq!(counts.writes.load(Ordering::SeqCst), 1);
        assert_eq!(counts.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clean_close_emits_final_block() {
        let counts = Arc::new(Counts::default());
        let mut stream = DeflateStream::new(Probe {
            input: &[],
            fail_writes: false,
            counts: counts.clone(),
        });
        stream.write_all(b"A003 LOGOUT\r\n").await.unwrap();
        stream.close().await.unwrap();
        assert!(counts.writes.load(Ordering::SeqCst) >= 1);
        assert_eq!(counts.shutdowns.load(Ordering::SeqCst), 1);
    }
}
