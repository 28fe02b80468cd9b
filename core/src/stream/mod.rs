/*
 * mod.rs
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

//! Stream layers under a protocol session: the raw connection, and the
//! transforms stacked on it in-band (TLS, DEFLATE). A session's pipeline is
//! always exactly one `Layer` value; upgrading wraps it, never replaces the
//! connection underneath.

pub mod close;
pub mod deflate;
pub mod replay;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::client::TlsStream;

pub use close::{CloseError, CloseStage, LayerCloser};
pub use deflate::DeflateStream;
pub use replay::Replay;

/// Anything that can carry a session: TCP, TLS, an in-memory duplex in tests.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConnection = Box<dyn Connection>;

/// The active pipeline stack.
pub enum Layer {
    /// The connection as established (plain TCP or implicit TLS).
    Plain(BoxedConnection),
    /// STARTTLS over the previous stack.
    Tls(Box<TlsStream<Layer>>),
    /// COMPRESS=DEFLATE over the previous stack, with drained bytes replayed first.
    Deflate(Box<DeflateStream<Replay<Layer>>>),
}

impl Layer {
    pub fn plain<C: Connection + 'static>(conn: C) -> Self {
        Layer::Plain(Box::new(conn))
    }

    /// Wrap `below` in a deflate codec whose read source starts with `held`.
    pub fn deflate(held: Bytes, below: Layer) -> Self {
        Layer::Deflate(Box::new(DeflateStream::new(Replay::new(held, below))))
    }

    pub fn tls(stream: TlsStream<Layer>) -> Self {
        Layer::Tls(Box::new(stream))
    }

    pub fn is_compressed(&self) -> bool {
        match self {
            Layer::Plain(_) => false,
            Layer::Tls(t) => t.get_ref().0.is_compressed(),
            Layer::Deflate(_) => true,
        }
    }

    pub fn is_tls(&self) -> bool {
        match self {
            Layer::Plain(_) => false,
            Layer::Tls(_) => true,
            Layer::Deflate(d) => d.get_ref().get_ref().is_tls(),
        }
    }

    /// Outermost first, e.g. "deflate/tls/plain".
    pub fn describe(&self) -> String {
        match self {
            Layer::Plain(_) => "plain".to_string(),
            Layer::Tls(t) => format!("tls/{}", t.get_ref().0.describe()),
            Layer::Deflate(d) => format!("deflate/{}", d.get_ref().get_ref().describe()),
        }
    }

    /// Tear the stack down outermost first. Every layer gets its close attempt.
    pub async fn close(self) -> Result<(), CloseError> {
        let mut closer = LayerCloser::new();
        match self {
            Layer::Plain(mut conn) => {
                closer.attempt(CloseStage::Connection, conn.shutdown().await);
            }
            Layer::Tls(mut tls) => {
                closer.attempt(CloseStage::Tls, tls.shutdown().await);
            }
            Layer::Deflate(codec) => {
                closer.absorb(codec.close().await);
            }
        }
        closer.finish()
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Layer").field(&self.describe()).finish()
    }
}

impl AsyncRead for Layer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Layer::Plain(c) => Pin::new(c).poll_read(cx, buf),
            Layer::Tls(t) => Pin::new(t).poll_read(cx, buf),
            Layer::Deflate(d) => Pin::new(d).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Layer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Layer::Plain(c) => Pin::new(c).poll_write(cx, buf),
            Layer::Tls(t) => Pin::new(t).poll_write(cx, buf),
            Layer::Deflate(d) => Pin::new(d).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Layer::Plain(c) => Pin::new(c).poll_flush(cx),
            Layer::Tls(t) => Pin::new(t).poll_flush(cx),
            Layer::Deflate(d) => Pin::new(d).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Layer::Plain(c) => Pin::new(c).poll_shutdown(cx),
            Layer::Tls(t) => Pin::new(t).poll_shutdown(cx),
            Layer::Deflate(d) => Pin::new(d).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn deflate_layer_replays_then_inflates() {
        let (mut peer, local) = tokio::io::duplex(4096);
        let mut server = DeflateStream::new(Vec::<u8>::new());
        server.write_all(b"A001 X\r\n").await.unwrap();
        server.flush().await.unwrap();
        // What the old pipeline had already buffered when the swap happened.
        let held = Bytes::from(std::mem::take(server.get_mut()));
        server.write_all(b"* OK still here\r\n").await.unwrap();
        server.flush().await.unwrap();
        peer.write_all(server.get_ref()).await.unwrap();

        let mut layer = Layer::deflate(held, Layer::plain(local));
        assert!(layer.is_compressed());
        assert!(!layer.is_tls());
        assert_eq!(layer.describe(), "deflate/plain");

        let mut first = [0u8; 8];
        layer.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"A001 X\r\n");
        let mut second = [0u8; 17];
        layer.read_exact(&mut second).await.unwrap();
        assert_eq!(&second, b"* OK still here\r\n");
    }

    #[tokio::test]
    async fn plain_close_shuts_connection_down() {
        let (mut peer, local) = tokio::io::duplex(64);
        let layer = Layer::plain(local);
        layer.close().await.unwrap();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
