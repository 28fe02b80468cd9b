/*
 * upgrade.rs
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

//! In-band transport upgrades (COMPRESS=DEFLATE, STARTTLS).
//!
//! The negotiating caller sends the command and waits. The reader task sees
//! the tagged OK and, before reading anything else, swaps the pipeline:
//! it takes whatever it had already buffered from the old stream, rejoins
//! the read and write halves, wraps them in the new layer, and splits again.
//! For DEFLATE the buffered bytes are compressed data and are replayed into
//! the new codec. For STARTTLS they would be unauthenticated plaintext and
//! the swap fails instead.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::BufReader;
use tokio::sync::oneshot;

use super::client::{ImapConnection, PipelineReader, Response, Shared};
use super::error::ImapClientError;
use crate::net;
use crate::stream::Layer;

/// A stream transform negotiated in-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    Deflate,
    StartTls { host: String },
}

impl Transform {
    pub fn command(&self) -> &'static str {
        match self {
            Transform::Deflate => "COMPRESS DEFLATE",
            Transform::StartTls { .. } => "STARTTLS",
        }
    }

    /// Capability the server must advertise for this transform.
    pub fn capability(&self) -> &'static str {
        match self {
            Transform::Deflate => "COMPRESS=DEFLATE",
            Transform::StartTls { .. } => "STARTTLS",
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Deflate => f.write_str("DEFLATE"),
            Transform::StartTls { .. } => f.write_str("TLS"),
        }
    }
}

/// Attached to the pending upgrade command; `installed` fires once the new
/// pipeline carries both directions.
pub(super) struct PendingUpgrade {
    pub(super) transform: Transform,
    pub(super) installed: oneshot::Sender<()>,
}

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// The write half was not in its slot, so the halves cannot be rejoined.
    #[error("pipeline writer unavailable")]
    WriterUnavailable,
    /// Bytes arrived after the STARTTLS acknowledgment but before the handshake.
    #[error("{0} bytes of plaintext received after STARTTLS acknowledgment")]
    UnexpectedPlaintext(usize),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

/// Replace the pipeline with `transform` stacked on it. Runs on the reader
/// task, so nothing else reads the old stream meanwhile; the writer lock keeps
/// callers out until the new write half is in place.
pub(super) async fn install(
    reader: PipelineReader,
    shared: &Shared,
    transform: &Transform,
) -> Result<PipelineReader, SwapError> {
    let mut slot = shared.writer.lock().await;
    let held = Bytes::copy_from_slice(reader.buffer());
    let writer = slot.take().ok_or(SwapError::WriterUnavailable)?;
    let below = reader.into_inner().unsplit(writer);

    let layer = match transform {
        Transform::Deflate => Layer::deflate(held, below),
        Transform::StartTls { host } => {
            if !held.is_empty() {
                return Err(SwapError::UnexpectedPlaintext(held.len()));
            }
            let tls = net::upgrade_to_tls(below, host)
                .await
                .map_err(SwapError::Handshake)?;
            Layer::tls(tls)
        }
    };
    shared.record_install(transform, &layer);
    tracing::debug!(
        transform = %transform,
        stack = %layer.describe(),
        "pipeline upgraded"
    );
    let (read_half, write_half) = tokio::io::split(layer);
    *slot = Some(write_half);
    Ok(BufReader::new(read_half))
}

/// Clears the in-progress flag however the negotiation ends.
struct UpgradeGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> UpgradeGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for UpgradeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl ImapConnection {
    /// Negotiate `transform` and wait until the new pipeline is installed.
    ///
    /// On NO/BAD the pipeline is untouched and `Rejected` is returned. If the
    /// swap itself fails the session is torn down and `Swap` is returned.
    pub async fn upgrade_transport(
        &self,
        transform: Transform,
    ) -> Result<Response, ImapClientError> {
        // Checked under the guard: an upgrade finishing meanwhile cannot slip past.
        let _guard = UpgradeGuard::acquire(&self.shared.upgrading)
            .ok_or(ImapClientError::UpgradeInProgress)?;
        if self.shared.transform_active(&transform) {
            return Err(ImapClientError::AlreadyActive(transform));
        }
        if matches!(transform, Transform::StartTls { .. }) && self.transport().compressed {
            return Err(ImapClientError::protocol(
                "STARTTLS is not allowed once compression is active",
            ));
        }

        let command = transform.command();
        let (installed, installed_rx) = oneshot::channel();
        let handle = self
            .submit(
                command,
                Some(PendingUpgrade {
                    transform,
                    installed,
                }),
            )
            .await?;
        let response = handle.wait().await?;
        installed_rx
            .await
            .map_err(|_| ImapClientError::ConnectionLost)?;
        Ok(response)
    }

    /// COMPRESS DEFLATE (RFC 4978).
    pub async fn compress_deflate(&self) -> Result<Response, ImapClientError> {
        self.upgrade_transport(Transform::Deflate).await
    }

    /// STARTTLS, verifying the certificate against `host`.
    pub async fn start_tls(&self, host: &str) -> Result<Response, ImapClientError> {
        self.upgrade_transport(Transform::StartTls {
            host: host.to_string(),
        })
        .await
    }

    /// Transforms active on the pipeline, outermost first.
    pub fn active_transforms(&self) -> Vec<Transform> {
        let state = self.transport();
        let mut active = Vec::new();
        if state.compressed {
            active.push(Transform::Deflate);
        }
        if state.tls {
            active.push(Transform::StartTls {
                host: String::new(),
            });
        }
        active
    }

    pub fn is_compressed(&self) -> bool {
        self.transport().compressed
    }

    pub fn is_tls(&self) -> bool {
        self.transport().tls
    }
}
