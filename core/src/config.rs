/*
 * config.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte.
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

//! IMAP session configuration: where to connect, how to secure the
//! connection, credentials, and whether to negotiate compression.
//! Can be built in code or from an imap:// / imaps:// URI.

use std::fmt;
use std::time::Duration;

use crate::protocol::imap::ImapClientError;
use crate::uri::{imap_store_uri, parse_imap_uri};

/// How the connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// No TLS at all.
    Plain,
    /// Connect plain, then STARTTLS before anything else.
    StartTls,
    /// TLS from the first byte (IMAPS).
    ImplicitTls,
}

#[derive(Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Negotiate COMPRESS=DEFLATE after login when the server offers it.
    pub compress: bool,
    pub connect_timeout: Option<Duration>,
    /// Idle limit for the response reader; expiry ends the session.
    pub read_timeout: Option<Duration>,
    /// Log every protocol line at trace level (LOGIN arguments are redacted).
    pub trace_wire: bool,
}

impl ImapConfig {
    /// Port 993 means implicit TLS, anything else STARTTLS.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: if port == 993 {
                Security::ImplicitTls
            } else {
                Security::StartTls
            },
            username: None,
            password: None,
            compress: true,
            connect_timeout: Some(Duration::from_secs(30)),
            read_timeout: None,
            trace_wire: false,
        }
    }

    pub fn set_security(&mut self, security: Security) -> &mut Self {
        self.security = security;
        self
    }

    pub fn set_credentials(
        &mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> &mut Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn set_compress(&mut self, compress: bool) -> &mut Self {
        self.compress = compress;
        self
    }

    pub fn set_connect_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.read_timeout = timeout;
        self
    }

    pub fn set_trace_wire(&mut self, trace: bool) -> &mut Self {
        self.trace_wire = trace;
        self
    }

    /// Build from imap://user@host:port?compress=deflate|none&tls=starttls|none
    /// or imaps://user@host:port. The password is never part of the URI.
    pub fn from_uri(uri: &str) -> Result<Self, ImapClientError> {
        let parsed = parse_imap_uri(uri).map_err(ImapClientError::Config)?;
        let mut config = Self::new(parsed.host.clone(), parsed.port);
        config.security = if parsed.implicit_tls {
            Security::ImplicitTls
        } else {
            match parsed.param("tls") {
                None | Some("starttls") => Security::StartTls,
                Some("none") => Security::Plain,
                Some(other) => {
                    return Err(ImapClientError::Config(format!("unknown tls mode: {}", other)))
                }
            }
        };
        match parsed.param("compress") {
            None | Some("deflate") => config.compress = true,
            Some("none") => config.compress = false,
            Some(other) => {
                return Err(ImapClientError::Config(format!("unknown compression: {}", other)))
            }
        }
        config.username = parsed.user;
        Ok(config)
    }

    /// URI form of this config; the inverse of `from_uri` (without the password).
    pub fn to_uri(&self) -> String {
        let user = self.username.as_deref().unwrap_or("");
        let mut uri = imap_store_uri(user, &self.host, self.port);
        // imap_store_uri picks the scheme from the port; security wins.
        match (self.security, uri.starts_with("imaps://")) {
            (Security::ImplicitTls, false) => uri = uri.replacen("imap://", "imaps://", 1),
            (Security::StartTls | Security::Plain, true) => {
                uri = uri.replacen("imaps://", "imap://", 1)
            }
            _ => {}
        }
        if self.username.is_none() {
            uri = uri.replacen("://@", "://", 1);
        }
        let mut params = Vec::new();
        if self.security == Security::Plain {
            params.push("tls=none");
        }
        if !self.compress {
            params.push("compress=none");
        }
        if !params.is_empty() {
            uri.push('?');
            uri.push_str(&params.join("&"));
        }
        uri
    }
}

impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("compress", &self.compress)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("trace_wire", &self.trace_wire)
            .finish()
    }
}
