/*
 * close.rs
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

//! Ordered teardown of stacked stream layers.
//!
//! Every layer gets exactly one close attempt, in order, whatever happened to
//! the layers before it. Failures are collected and reported together.

use std::fmt;
use std::io;

/// Which layer of a codec stack a close failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStage {
    /// Decompressing read side.
    Read,
    /// Compressing write side (final block + flush).
    Write,
    /// The wrapped stream's shutdown.
    Connection,
    /// TLS close_notify and shutdown.
    Tls,
}

impl fmt::Display for CloseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseStage::Read => "read",
            CloseStage::Write => "write",
            CloseStage::Connection => "connection",
            CloseStage::Tls => "tls",
        };
        f.write_str(s)
    }
}

/// One or more layers failed to close. Each entry is (stage, error) in close order.
#[derive(Debug)]
pub struct CloseError {
    failures: Vec<(CloseStage, io::Error)>,
}

impl CloseError {
    pub fn failures(&self) -> &[(CloseStage, io::Error)] {
        &self.failures
    }

    /// Stages that failed, in the order they were attempted.
    pub fn stages(&self) -> Vec<CloseStage> {
        self.failures.iter().map(|(s, _)| *s).collect()
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close failed:")?;
        for (i, (stage, e)) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, " {}: {}", stage, e)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

/// Collects the outcome of each close stage. Use one per teardown:
/// `attempt` every layer in order, then `finish`.
#[derive(Debug, Default)]
pub struct LayerCloser {
    failures: Vec<(CloseStage, io::Error)>,
}

impl LayerCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of closing one layer. Never short-circuits.
    pub fn attempt(&mut self, stage: CloseStage, result: io::Result<()>) -> &mut Self {
        if let Err(e) = result {
            tracing::debug!(%stage, error = %e, "layer close failed");
            self.failures.push((stage, e));
        }
        self
    }

    /// Fold in failures from a nested stack (e.g. the layer below a codec).
    pub fn absorb(&mut self, result: Result<(), CloseError>) -> &mut Self {
        if let Err(e) = result {
            self.failures.extend(e.failures);
        }
        self
    }

    pub fn finish(self) -> Result<(), CloseError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError {
                failures: self.failures,
            })
        }
    }
}
