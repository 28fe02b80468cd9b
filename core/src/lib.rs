/*
 * lib.rs
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

//! Tagliacarte IMAP core: session pipeline, stream layers, and the in-band
//! upgrades (STARTTLS, COMPRESS=DEFLATE) that stack on them.

pub mod config;
pub mod net;
pub mod protocol;
pub mod stream;
pub mod uri;

pub use config::{ImapConfig, Security};
pub use protocol::imap::{connect, ImapClientError, ImapConnection, Transform};
