/*
 * error.rs
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

//! IMAP client errors.

use std::io;

use super::client::ImapStatus;
use super::upgrade::{SwapError, Transform};
use crate::stream::CloseError;

/// IMAP client error (network, protocol, negotiation, teardown).
#[derive(Debug, thiserror::Error)]
pub enum ImapClientError {
    /// Server answered NO or BAD. The session is still usable.
    #[error("{status} {text}")]
    Rejected { status: ImapStatus, text: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The response reader stopped before this command completed.
    #[error("connection lost")]
    ConnectionLost,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Another transport upgrade has not finished yet.
    #[error("a transport upgrade is already in progress")]
    UpgradeInProgress,

    #[error("{0} is already active")]
    AlreadyActive(Transform),

    /// The pipeline could not be replaced; the session has been torn down.
    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error(transparent)]
    Close(#[from] CloseError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ImapClientError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for a NO/BAD answer, i.e. the session can carry on.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ImapClientError::Rejected { .. })
    }
}
