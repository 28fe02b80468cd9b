/*
 * uri.rs
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

//! IMAP store URLs: imap://user@host:port (plain or STARTTLS) and
//! imaps://user@host:port (implicit TLS). Session options ride in the query,
//! e.g. `imap://me%40example.org@mail.example.org:143?compress=deflate&tls=none`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Userinfo in authority: encode @ and other reserved so one @ separates userinfo from host.
const USERINFO: &AsciiSet = &CONTROLS
    .add(b'@')
    .add(b':')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'#')
    .add(b'[')
    .add(b']');

/// IMAP store URL: imap://user@host:port, or imaps://user@host:port for
/// implicit TLS (port 993).
pub fn imap_store_uri(user_at_host: &str, host: &str, port: u16) -> String {
    let userinfo = utf8_percent_encode(user_at_host, USERINFO).to_string();
    let scheme = if port == 993 {
        "imaps"
    } else {
        "imap"
    };
    format!("{}://{}@{}:{}", scheme, userinfo, host, port)
}

/// Pieces of an imap:// or imaps:// URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapUri {
    pub implicit_tls: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    /// Query parameters in order, keys lowercased, values percent-decoded.
    pub params: Vec<(String, String)>,
}

impl ImapUri {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Parse an imap:// or imaps:// URL. Port defaults to 143 / 993.
pub fn parse_imap_uri(uri: &str) -> Result<ImapUri, String> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| format!("not a URL: {}", uri))?;
    let implicit_tls = match scheme.to_ascii_lowercase().as_str() {
        "imap" => false,
        "imaps" => true,
        other => return Err(format!("unsupported scheme: {}", other)),
    };
    let (authority, query) = match rest.split_once('?') {
        Some((a, q)) => (a, Some(q)),
        None => (rest, None),
    };
    let authority = authority.trim_end_matches('/');
    let (user, hostport) = match authority.rsplit_once('@') {
        Some((u, h)) => (Some(decode(u)), h),
        None => (None, authority),
    };
    let default_port = if implicit_tls { 993 } else { 143 };
    // [v6addr]:port or host:port
    let (host, port_str) = if let Some(v6) = hostport.strip_prefix('[') {
        let (h, after) = v6
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 literal: {}", hostport))?;
        (h, after.strip_prefix(':'))
    } else {
        match hostport.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (hostport, None),
        }
    };
    let port = match port_str {
        Some(p) => p.parse::<u16>().map_err(|_| format!("invalid port: {}", p))?,
        None => default_port,
    };
    if host.is_empty() {
        return Err("missing host".to_string());
    }
    let mut params = Vec::new();
    if let Some(q) = query {
        for pair in q.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            params.push((decode(k).to_ascii_lowercase(), decode(v)));
        }
    }
    Ok(ImapUri {
        implicit_tls,
        user: user.filter(|u| !u.is_empty()),
        host: host.to_string(),
        port,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imap_imaps_scheme() {
        let u = imap_store_uri("user", "host", 993);
        assert_eq!(u, "imaps://user@host:993");
        let u2 = imap_store_uri("user", "host", 143);
        assert_eq!(u2, "imap://user@host:143");
    }

    #[test]
    fn parse_encoded_user_and_query() {
        let u = parse_imap_uri(
            "imap://me%40example.org@mail.example.org:1143?compress=deflate&TLS=none",
        )
        .unwrap();
        assert!(!u.implicit_tls);
        assert_eq!(u.user.as_deref(), Some("me@example.org"));
        assert_eq!(u.host, "mail.example.org");
        assert_eq!(u.port, 1143);
        assert_eq!(u.param("compress"), Some("deflate"));
        assert_eq!(u.param("tls"), Some("none"));
    }

    #[test]
    fn default_ports() {
        assert_eq!(parse_imap_uri("imaps://host").unwrap().port, 993);
        assert_eq!(parse_imap_uri("imap://host/").unwrap().port, 143);
    }

    #[test]
    fn store_uri_parses_back() {
        let s = imap_store_uri("me@example.org", "mail.example.org", 993);
        let u = parse_imap_uri(&s).unwrap();
        assert!(u.implicit_tls);
        assert_eq!(u.user.as_deref(), Some("me@example.org"));
        assert_eq!(u.port, 993);
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(parse_imap_uri("pop3://host").is_err());
        assert!(parse_imap_uri("imap://:143").is_err());
    }
}
