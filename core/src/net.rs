/*
 * net.rs
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

//! TCP and TLS connection helpers.
//!
//! Implicit TLS handshakes immediately on connect. STARTTLS handshakes over
//! whatever stream the session is currently using, after the protocol has
//! negotiated it.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;

use crate::stream::BoxedConnection;

/// Build a root certificate store: platform native certs first, then webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = root_store.add(cert);
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "native root certificates unavailable");
        }
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// Default TLS client config (native + Mozilla roots, no client auth).
fn default_client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .with_root_certificates(build_root_store())
        .with_no_client_auth();
    Arc::new(config)
}

static DEFAULT_CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

fn default_connector() -> &'static TlsConnector {
    DEFAULT_CONNECTOR.get_or_init(|| TlsConnector::from(default_client_config()))
}

fn server_name(host: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))
}

async fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let tcp = match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(&addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => TcpStream::connect(&addr).await?,
    };
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

/// Connect without TLS (plain IMAP, or STARTTLS later in the session).
pub async fn connect_plain(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> io::Result<BoxedConnection> {
    let tcp = connect_tcp(host, port, timeout).await?;
    tracing::debug!(host, port, "connected (plain)");
    Ok(Box::new(tcp))
}

/// Connect with implicit TLS (e.g. IMAPS 993): TCP connect then immediate handshake.
pub async fn connect_implicit_tls(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> io::Result<BoxedConnection> {
    let tcp = connect_tcp(host, port, timeout).await?;
    let tls = default_connector()
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
    tracing::debug!(host, port, "connected (implicit TLS)");
    Ok(Box::new(tls))
}

/// Handshake TLS over an already established stream (after STARTTLS was accepted).
pub async fn upgrade_to_tls<IO>(io: IO, host: &str) -> io::Result<TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    default_connector()
        .connect(server_name(host)?, io)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))
}
