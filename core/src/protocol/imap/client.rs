/*
 * client.rs
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

//! Async IMAP client: tagged command pipeline over a stream layer.
//!
//! One background reader task per connection owns the read half of the
//! pipeline, reads response lines (with literals) and completes commands by
//! tag. Callers write commands through the shared writer slot. The reader is
//! also the only task that ever replaces the pipeline (see `upgrade`).

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use super::error::ImapClientError;
use super::upgrade::{self, PendingUpgrade, Transform};
use crate::config::{ImapConfig, Security};
use crate::net;
use crate::stream::{CloseError, Connection, Layer};

/// Largest literal we are prepared to buffer for one response.
const MAX_LITERAL_SIZE: u32 = 64 * 1024 * 1024;

/// Read side of the active pipeline, owned by the reader task.
pub(super) type PipelineReader = BufReader<ReadHalf<Layer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapStatus {
    Ok,
    No,
    Bad,
    Bye,
    Preauth,
}

impl fmt::Display for ImapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImapStatus::Ok => "OK",
            ImapStatus::No => "NO",
            ImapStatus::Bad => "BAD",
            ImapStatus::Bye => "BYE",
            ImapStatus::Preauth => "PREAUTH",
        };
        f.write_str(s)
    }
}

/// One line of IMAP response (untagged *, continuation +, or tagged A0001).
#[derive(Debug, Clone)]
pub struct ImapLine {
    pub raw: String,
    pub tag: Option<String>,
    pub untagged: bool,
    pub continuation: bool,
    pub status: Option<ImapStatus>,
}

impl ImapLine {
    /// Text after the tag and status word, e.g. "[CAPABILITY IMAP4rev1] done".
    pub fn text(&self) -> &str {
        let after_tag = self.raw.split_once(' ').map(|(_, r)| r).unwrap_or("");
        if self.status.is_some() {
            after_tag.split_once(' ').map(|(_, r)| r).unwrap_or("")
        } else {
            after_tag
        }
    }
}

fn parse_status(rest: &str) -> Option<ImapStatus> {
    let word = rest.split(' ').next().unwrap_or("");
    match word.to_ascii_uppercase().as_str() {
        "OK" => Some(ImapStatus::Ok),
        "NO" => Some(ImapStatus::No),
        "BAD" => Some(ImapStatus::Bad),
        "BYE" => Some(ImapStatus::Bye),
        "PREAUTH" => Some(ImapStatus::Preauth),
        _ => None,
    }
}

/// Classify a response line. Literal data is handled by the reader, not here.
pub fn parse_line(s: &str) -> ImapLine {
    let raw = s.to_string();
    if s.starts_with('+') {
        return ImapLine {
            raw,
            tag: None,
            untagged: false,
            continuation: true,
            status: None,
        };
    }
    if let Some(rest) = s.strip_prefix('*') {
        return ImapLine {
            raw,
            tag: None,
            untagged: true,
            continuation: false,
            status: parse_status(rest.trim_start()),
        };
    }
    let (tag, rest) = s.split_once(' ').unwrap_or((s, ""));
    ImapLine {
        raw,
        tag: Some(tag.to_string()).filter(|t| !t.is_empty()),
        untagged: false,
        continuation: false,
        status: parse_status(rest),
    }
}

/// A response line plus any literals it carried, in order.
#[derive(Debug, Clone)]
pub struct ResponseLine {
    pub line: ImapLine,
    pub literals: Vec<Vec<u8>>,
}

/// Completed command: untagged lines seen while it was active, then its tagged line.
#[derive(Debug)]
pub struct Response {
    pub untagged: Vec<ResponseLine>,
    pub completion: ImapLine,
}

impl Response {
    fn into_result(self) -> Result<Self, ImapClientError> {
        match self.completion.status {
            Some(ImapStatus::Ok) => Ok(self),
            Some(status) => Err(ImapClientError::Rejected {
                status,
                text: self.completion.text().to_string(),
            }),
            None => Err(ImapClientError::protocol(format!(
                "tagged response without status: {}",
                self.completion.raw
            ))),
        }
    }
}

/// "{123}" or "{123+}" at end of line.
fn literal_size(line: &str) -> Option<u32> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].trim_end_matches('+').parse().ok()
}

/// Read up to and including LF; return the line without CRLF.
async fn read_crlf_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 || buf.last() != Some(&b'\n') {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
    }
    let mut end = buf.len() - 1;
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Read one logical response line: each `{N}` literal is read in full and the
/// rest of the line that follows it is appended to the line text.
async fn read_response_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<ResponseLine>
where
    R: AsyncBufRead + Unpin,
{
    let mut text = read_crlf_line(reader, buf).await?;
    let mut literals = Vec::new();
    while let Some(size) = literal_size(&text) {
        if size > MAX_LITERAL_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("literal of {} bytes exceeds limit", size),
            ));
        }
        let mut lit = vec![0u8; size as usize];
        reader.read_exact(&mut lit).await?;
        literals.push(lit);
        let more = read_crlf_line(reader, buf).await?;
        text.push_str(&more);
    }
    Ok(ResponseLine {
        line: parse_line(&text),
        literals,
    })
}

async fn read_with_timeout<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: Option<Duration>,
) -> io::Result<ResponseLine>
where
    R: AsyncBufRead + Unpin,
{
    match limit {
        Some(d) => tokio::time::timeout(d, read_response_line(reader, buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
        None => read_response_line(reader, buf).await,
    }
}

/// Write a line (no CRLF) then CRLF, and flush.
async fn write_line<S>(stream: &mut S, line: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(line).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}

pub fn quote_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Capability list from "* CAPABILITY ..." or a "[CAPABILITY ...]" response code.
pub fn parse_capabilities(line: &str) -> Vec<String> {
    const CODE: &str = "[CAPABILITY ";
    let list = if let Some(rest) = line.strip_prefix("* CAPABILITY ") {
        rest
    } else if let Some(i) = line.find(CODE) {
        line[i + CODE.len()..].split(']').next().unwrap_or("")
    } else {
        ""
    };
    list.split_whitespace().map(|w| w.to_ascii_uppercase()).collect()
}

/// Command as seen in wire traces; credentials are not logged.
fn redact(command: &str) -> &str {
    match command.split_once(' ') {
        Some((verb, _)) if verb.eq_ignore_ascii_case("LOGIN") => "LOGIN <redacted>",
        _ => command,
    }
}

/// A command awaiting its tagged response.
pub(super) struct PendingCommand {
    tag: String,
    untagged: Vec<ResponseLine>,
    done: oneshot::Sender<Result<Response, ImapClientError>>,
    upgrade: Option<PendingUpgrade>,
}

/// Which transforms the active pipeline carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportState {
    pub tls: bool,
    pub compressed: bool,
    /// Layer stack, outermost first, e.g. "deflate/tls/plain". The base is
    /// "tls" rather than "plain" for an implicit-TLS connection.
    pub stack: String,
}

impl TransportState {
    fn of(layer: &Layer, implicit_tls: bool) -> Self {
        Self {
            tls: implicit_tls || layer.is_tls(),
            compressed: layer.is_compressed(),
            stack: stack_name(layer, implicit_tls),
        }
    }
}

fn stack_name(layer: &Layer, implicit_tls: bool) -> String {
    let stack = layer.describe();
    match stack.strip_suffix("plain") {
        Some(upper) if implicit_tls => format!("{}tls", upper),
        _ => stack,
    }
}

enum Control {
    Close(oneshot::Sender<Result<(), CloseError>>),
}

/// State shared by callers and the reader task.
pub(super) struct Shared {
    /// Write half of the active pipeline. Replaced only by the reader task, under this lock.
    pub(super) writer: AsyncMutex<Option<WriteHalf<Layer>>>,
    pending: Mutex<VecDeque<PendingCommand>>,
    tag_counter: AtomicU32,
    alive: AtomicBool,
    pub(super) upgrading: AtomicBool,
    transport: Mutex<TransportState>,
    capabilities: Mutex<Vec<String>>,
    unsolicited_tx: mpsc::UnboundedSender<ResponseLine>,
    unsolicited_rx: Mutex<Option<mpsc::UnboundedReceiver<ResponseLine>>>,
    unsolicited_wanted: AtomicBool,
    trace_wire: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    pub(super) fn new(
        writer: WriteHalf<Layer>,
        transport: TransportState,
        capabilities: Vec<String>,
        trace_wire: bool,
    ) -> Self {
        let (unsolicited_tx, unsolicited_rx) = mpsc::unbounded_channel();
        Self {
            writer: AsyncMutex::new(Some(writer)),
            pending: Mutex::new(VecDeque::new()),
            tag_counter: AtomicU32::new(1),
            alive: AtomicBool::new(true),
            upgrading: AtomicBool::new(false),
            transport: Mutex::new(transport),
            capabilities: Mutex::new(capabilities),
            unsolicited_tx,
            unsolicited_rx: Mutex::new(Some(unsolicited_rx)),
            unsolicited_wanted: AtomicBool::new(false),
            trace_wire,
        }
    }

    fn next_tag(&self) -> String {
        format!("A{:04}", self.tag_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn take_pending(&self, tag: &str) -> Option<PendingCommand> {
        let mut pending = lock(&self.pending);
        let pos = pending.iter().position(|p| p.tag == tag)?;
        pending.remove(pos)
    }

    /// Untagged and continuation lines go to the oldest pending command; with
    /// nothing pending they are unsolicited.
    fn dispatch_untagged(&self, response: ResponseLine) {
        {
            let mut pending = lock(&self.pending);
            if let Some(front) = pending.front_mut() {
                front.untagged.push(response);
                return;
            }
        }
        if self.unsolicited_wanted.load(Ordering::Acquire) {
            let _ = self.unsolicited_tx.send(response);
        } else {
            tracing::debug!(line = %response.line.raw, "unsolicited response");
        }
    }

    pub(super) fn transport(&self) -> TransportState {
        lock(&self.transport).clone()
    }

    pub(super) fn transform_active(&self, transform: &Transform) -> bool {
        let state = lock(&self.transport);
        match transform {
            Transform::Deflate => state.compressed,
            Transform::StartTls { .. } => state.tls,
        }
    }

    /// Note a freshly installed pipeline. Capabilities learned before STARTTLS are void.
    pub(super) fn record_install(&self, transform: &Transform, layer: &Layer) {
        {
            let mut state = lock(&self.transport);
            // TLS without a Tls layer means the connection itself is TLS.
            let implicit_tls = state.tls && !layer.is_tls();
            state.compressed = layer.is_compressed();
            state.tls = state.tls || layer.is_tls();
            state.stack = stack_name(layer, implicit_tls);
        }
        if matches!(transform, Transform::StartTls { .. }) {
            lock(&self.capabilities).clear();
        }
    }

    fn set_capabilities(&self, caps: Vec<String>) {
        *lock(&self.capabilities) = caps;
    }
}

/// Handle to a command in flight.
pub struct CommandHandle {
    tag: String,
    rx: oneshot::Receiver<Result<Response, ImapClientError>>,
}

impl CommandHandle {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wait for the tagged response. NO/BAD become `ImapClientError::Rejected`.
    pub async fn wait(self) -> Result<Response, ImapClientError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ImapClientError::ConnectionLost),
        }
    }
}

/// Handle to a live IMAP session. Cheaply cloneable; the session closes when
/// `close` is called, the server hangs up, or the last handle is dropped.
#[derive(Clone)]
pub struct ImapConnection {
    pub(super) shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
    greeting: Arc<ImapLine>,
}

impl ImapConnection {
    /// Read the greeting from `conn` and start the reader task.
    pub async fn start<C>(conn: C, config: &ImapConfig) -> Result<Self, ImapClientError>
    where
        C: Connection + 'static,
    {
        Self::start_layer(Layer::plain(conn), config).await
    }

    async fn start_layer(layer: Layer, config: &ImapConfig) -> Result<Self, ImapClientError> {
        let transport = TransportState::of(&layer, config.security == Security::ImplicitTls);
        let (read_half, write_half) = tokio::io::split(layer);
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::with_capacity(4096);
        let greeting = read_with_timeout(&mut reader, &mut buf, config.read_timeout).await?;
        if config.trace_wire {
            tracing::trace!("<< {}", greeting.line.raw);
        }
        let greeting = check_greeting(greeting.line)?;
        let capabilities = parse_capabilities(&greeting.raw);

        let shared = Arc::new(Shared::new(
            write_half,
            transport,
            capabilities,
            config.trace_wire,
        ));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(reader_loop(
            reader,
            Arc::clone(&shared),
            control_rx,
            config.read_timeout,
        ));
        Ok(Self {
            shared,
            control_tx,
            greeting: Arc::new(greeting),
        })
    }

    pub fn greeting(&self) -> &ImapLine {
        &self.greeting
    }

    /// Returns true while the reader task is running.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> TransportState {
        self.shared.transport()
    }

    /// Last known capability list (greeting, CAPABILITY, or LOGIN response code).
    pub fn capabilities(&self) -> Vec<String> {
        lock(&self.shared.capabilities).clone()
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        lock(&self.shared.capabilities)
            .iter()
            .any(|c| c.eq_ignore_ascii_case(cap))
    }

    /// Receiver for untagged responses that arrive while no command is pending
    /// (EXISTS, EXPUNGE, BYE...). Can be taken once.
    pub fn unsolicited(&self) -> Option<mpsc::UnboundedReceiver<ResponseLine>> {
        let rx = lock(&self.shared.unsolicited_rx).take()?;
        self.shared.unsolicited_wanted.store(true, Ordering::Release);
        Some(rx)
    }

    /// Send a command and return without waiting for the response.
    pub async fn begin_command(&self, command: &str) -> Result<CommandHandle, ImapClientError> {
        self.submit(command, None).await
    }

    /// Send a command and wait for its tagged response.
    pub async fn command(&self, command: &str) -> Result<Response, ImapClientError> {
        self.begin_command(command).await?.wait().await
    }

    /// Tag, register and write one command. Registration happens under the
    /// writer lock so pending order matches wire order.
    pub(super) async fn submit(
        &self,
        command: &str,
        upgrade: Option<PendingUpgrade>,
    ) -> Result<CommandHandle, ImapClientError> {
        if !self.is_alive() {
            return Err(ImapClientError::ConnectionLost);
        }
        let mut slot = self.shared.writer.lock().await;
        let writer = slot.as_mut().ok_or(ImapClientError::ConnectionLost)?;
        let tag = self.shared.next_tag();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).push_back(PendingCommand {
            tag: tag.clone(),
            untagged: Vec::new(),
            done: tx,
            upgrade,
        });
        if self.shared.trace_wire {
            tracing::trace!(">> {} {}", tag, redact(command));
        }
        let line = format!("{} {}", tag, command);
        if let Err(e) = write_line(writer, line.as_bytes()).await {
            self.shared.take_pending(&tag);
            return Err(e.into());
        }
        Ok(CommandHandle { tag, rx })
    }

    /// Write bytes through the active pipeline as they are (e.g. literal data
    /// after a continuation). Compression, if active, is applied transparently.
    pub async fn write_raw(&self, data: &[u8]) -> Result<(), ImapClientError> {
        let mut slot = self.shared.writer.lock().await;
        let writer = slot.as_mut().ok_or(ImapClientError::ConnectionLost)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn capability(&self) -> Result<Vec<String>, ImapClientError> {
        let response = self.command("CAPABILITY").await?;
        let caps = response
            .untagged
            .iter()
            .find(|r| r.line.raw.starts_with("* CAPABILITY "))
            .map(|r| parse_capabilities(&r.line.raw))
            .unwrap_or_default();
        self.shared.set_capabilities(caps.clone());
        Ok(caps)
    }

    /// LOGIN. Capabilities may change after authentication: a response code
    /// replaces them, otherwise they are marked unknown.
    pub async fn login(&self, user: &str, pass: &str) -> Result<(), ImapClientError> {
        if self.has_capability("LOGINDISABLED") {
            return Err(ImapClientError::protocol("server advertises LOGINDISABLED"));
        }
        let cmd = format!("LOGIN {} {}", quote_string(user), quote_string(pass));
        let response = self.command(&cmd).await?;
        self.shared
            .set_capabilities(parse_capabilities(&response.completion.raw));
        Ok(())
    }

    pub async fn noop(&self) -> Result<Response, ImapClientError> {
        self.command("NOOP").await
    }

    /// LOGOUT; the server answers BYE then closes, which ends the reader task.
    pub async fn logout(&self) -> Result<(), ImapClientError> {
        self.command("LOGOUT").await?;
        Ok(())
    }

    /// Stop the reader task and close every pipeline layer in order.
    /// A session that already ended closes trivially.
    pub async fn close(&self) -> Result<(), ImapClientError> {
        let (tx, rx) = oneshot::channel();
        if self.control_tx.send(Control::Close(tx)).is_err() {
            return Ok(());
        }
        match rx.await {
            Ok(result) => result.map_err(ImapClientError::from),
            Err(_) => Ok(()),
        }
    }
}

fn check_greeting(line: ImapLine) -> Result<ImapLine, ImapClientError> {
    match line.status {
        Some(ImapStatus::Ok) | Some(ImapStatus::Preauth) if line.untagged => Ok(line),
        Some(ImapStatus::Bye) => Err(ImapClientError::protocol(format!(
            "server refused connection: {}",
            line.raw
        ))),
        _ => Err(ImapClientError::protocol(format!(
            "expected * OK greeting, got: {}",
            line.raw
        ))),
    }
}

enum ReaderEvent {
    Control(Option<Control>),
    Line(io::Result<ResponseLine>),
}

/// Reader task: read responses, complete commands by tag, run pipeline swaps.
async fn reader_loop(
    mut reader: PipelineReader,
    shared: Arc<Shared>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    read_timeout: Option<Duration>,
) {
    let mut buf = Vec::with_capacity(4096);
    loop {
        let event = tokio::select! {
            ctrl = control_rx.recv() => ReaderEvent::Control(ctrl),
            result = read_with_timeout(&mut reader, &mut buf, read_timeout) => {
                ReaderEvent::Line(result)
            }
        };
        let response = match event {
            ReaderEvent::Control(Some(Control::Close(reply))) => {
                tracing::debug!("closing session");
                let _ = reply.send(teardown(&shared, Some(reader)).await);
                return;
            }
            ReaderEvent::Control(None) => {
                tracing::debug!("all connection handles dropped; closing session");
                if let Err(e) = teardown(&shared, Some(reader)).await {
                    tracing::debug!(error = %e, "close after last handle dropped");
                }
                return;
            }
            ReaderEvent::Line(Err(e)) => {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    tracing::debug!("server closed connection");
                } else {
                    tracing::warn!(error = %e, "read failed; ending session");
                }
                if let Err(e) = teardown(&shared, Some(reader)).await {
                    tracing::debug!(error = %e, "close after connection loss");
                }
                return;
            }
            ReaderEvent::Line(Ok(r)) => r,
        };
        if shared.trace_wire {
            tracing::trace!("<< {}", response.line.raw);
        }

        let Some(tag) = response.line.tag.clone() else {
            shared.dispatch_untagged(response);
            continue;
        };
        let Some(mut cmd) = shared.take_pending(&tag) else {
            tracing::warn!(tag = %tag, "response for unknown tag");
            continue;
        };
        let ok = response.line.status == Some(ImapStatus::Ok);
        let result = Response {
            untagged: std::mem::take(&mut cmd.untagged),
            completion: response.line,
        }
        .into_result();

        match cmd.upgrade.take() {
            Some(upgrade) if ok => {
                if shared.transform_active(&upgrade.transform) {
                    // The peer now frames with a transform we will not stack twice.
                    tracing::error!(
                        transform = %upgrade.transform,
                        "duplicate upgrade acknowledged; tearing session down"
                    );
                    if let Err(e) = teardown(&shared, Some(reader)).await {
                        tracing::debug!(error = %e, "close after duplicate upgrade");
                    }
                    let _ = cmd
                        .done
                        .send(Err(ImapClientError::AlreadyActive(upgrade.transform)));
                    return;
                }
                match upgrade::install(reader, &shared, &upgrade.transform).await {
                    Ok(next) => {
                        reader = next;
                        let _ = upgrade.installed.send(());
                        let _ = cmd.done.send(result);
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            transform = %upgrade.transform,
                            "pipeline swap failed; tearing session down"
                        );
                        // The old halves were consumed by the failed swap; nothing left to close.
                        let _ = teardown(&shared, None).await;
                        let _ = cmd.done.send(Err(ImapClientError::Swap(e)));
                        return;
                    }
                }
            }
            // A rejected upgrade drops its installed signal unsent.
            _ => {
                let _ = cmd.done.send(result);
            }
        }
    }
}

/// Mark the session dead, fail everything pending, and close the pipeline if
/// both halves are still at hand.
async fn teardown(shared: &Shared, reader: Option<PipelineReader>) -> Result<(), CloseError> {
    shared.alive.store(false, Ordering::SeqCst);
    let writer = shared.writer.lock().await.take();
    let orphaned: Vec<PendingCommand> = lock(&shared.pending).drain(..).collect();
    for cmd in orphaned {
        let _ = cmd.done.send(Err(ImapClientError::ConnectionLost));
    }
    match (reader, writer) {
        (Some(r), Some(w)) => r.into_inner().unsplit(w).close().await,
        _ => Ok(()),
    }
}

/// Connect, read the greeting, then STARTTLS / LOGIN / COMPRESS as configured.
pub async fn connect(config: &ImapConfig) -> Result<ImapConnection, ImapClientError> {
    let conn = match config.security {
        Security::ImplicitTls => {
            net::connect_implicit_tls(&config.host, config.port, config.connect_timeout).await?
        }
        Security::StartTls | Security::Plain => {
            net::connect_plain(&config.host, config.port, config.connect_timeout).await?
        }
    };
    let session = ImapConnection::start_layer(Layer::Plain(conn), config).await?;
    let preauth = session.greeting().status == Some(ImapStatus::Preauth);

    if config.security == Security::StartTls {
        if session.capabilities().is_empty() {
            session.capability().await?;
        }
        if !session.has_capability("STARTTLS") {
            return Err(ImapClientError::protocol("server does not offer STARTTLS"));
        }
        session.start_tls(&config.host).await?;
        session.capability().await?;
    }

    if let (Some(user), Some(pass), false) = (&config.username, &config.password, preauth) {
        session.login(user, pass).await?;
    }

    if config.compress {
        if session.capabilities().is_empty() {
            session.capability().await?;
        }
        if session.has_capability(Transform::Deflate.capability()) {
            match session.compress_deflate().await {
                Ok(_) => {}
                // Refused compression leaves a working uncompressed session.
                Err(e) if e.is_rejection() => {
                    tracing::debug!(host = %config.host, error = %e, "COMPRESS refused");
                }
                Err(e) => return Err(e),
            }
        } else {
            tracing::debug!(host = %config.host, "server does not offer COMPRESS=DEFLATE");
        }
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tagged_untagged_continuation() {
        let l = parse_line("A0001 OK [COMPRESSIONACTIVE] done");
        assert_eq!(l.tag.as_deref(), Some("A0001"));
        assert_eq!(l.status, Some(ImapStatus::Ok));
        assert_eq!(l.text(), "[COMPRESSIONACTIVE] done");

        let l = parse_line("* 3 EXISTS");
        assert!(l.untagged);
        assert_eq!(l.tag, None);
        assert_eq!(l.status, None);

        let l = parse_line("+ go ahead");
        assert!(l.continuation);
        assert_eq!(l.tag, None);
        assert_eq!(l.text(), "go ahead");

        let l = parse_line("A0002 NO");
        assert_eq!(l.status, Some(ImapStatus::No));
        assert_eq!(l.text(), "");
    }

    #[test]
    fn capabilities_from_list_and_code() {
        assert_eq!(
            parse_capabilities("* CAPABILITY IMAP4rev1 STARTTLS compress=deflate"),
            vec!["IMAP4REV1", "STARTTLS", "COMPRESS=DEFLATE"]
        );
        assert_eq!(
            parse_capabilities("* OK [CAPABILITY IMAP4rev1 LITERAL+] ready"),
            vec!["IMAP4REV1", "LITERAL+"]
        );
        assert!(parse_capabilities("* OK ready").is_empty());
    }

    #[test]
    fn literal_markers() {
        assert_eq!(literal_size("* 1 FETCH (BODY[] {12}"), Some(12));
        assert_eq!(literal_size("* 1 FETCH (BODY[] {12+}"), Some(12));
        assert_eq!(literal_size("* OK {not}"), None);
        assert_eq!(literal_size("* OK done"), None);
    }

    #[test]
    fn login_is_redacted() {
        assert_eq!(redact("LOGIN \"me\" \"secret\""), "LOGIN <redacted>");
        assert_eq!(redact("COMPRESS DEFLATE"), "COMPRESS DEFLATE");
    }

    #[tokio::test]
    async fn reads_literal_and_rest_of_line() {
        let data: &[u8] = b"* 1 FETCH (BODY[] {5}\r\nhello)\r\nA0001 OK\r\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        let first = read_response_line(&mut reader, &mut buf).await.unwrap();
        assert!(first.line.untagged);
        assert_eq!(first.literals, vec![b"hello".to_vec()]);
        assert!(first.line.raw.ends_with(')'));
        let second = read_response_line(&mut reader, &mut buf).await.unwrap();
        assert_eq!(second.line.tag.as_deref(), Some("A0001"));
    }

    #[tokio::test]
    async fn eof_mid_line_is_unexpected_eof() {
        let data: &[u8] = b"* OK partial";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        let err = read_response_line(&mut reader, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn greeting_checks() {
        assert!(check_greeting(parse_line("* OK IMAP ready")).is_ok());
        assert!(check_greeting(parse_line("* PREAUTH welcome back")).is_ok());
        assert!(check_greeting(parse_line("* BYE go away")).is_err());
        assert!(check_greeting(parse_line("A1 OK what")).is_err());
    }

    #[test]
    fn rejection_carries_status_and_text() {
        let response = Response {
            untagged: Vec::new(),
            completion: parse_line("A0003 NO [COMPRESSIONACTIVE] already on"),
        };
        match response.into_result() {
            Err(ImapClientError::Rejected { status, text }) => {
                assert_eq!(status, ImapStatus::No);
                assert_eq!(text, "[COMPRESSIONACTIVE] already on");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn implicit_tls_base_is_named_tls() {
        let (_peer, local) = tokio::io::duplex(64);
        let plain = Layer::plain(local);
        assert_eq!(stack_name(&plain, false), "plain");
        assert_eq!(stack_name(&plain, true), "tls");
        let (_peer, local) = tokio::io::duplex(64);
        let compressed = Layer::deflate(bytes::Bytes::new(), Layer::plain(local));
        assert_eq!(stack_name(&compressed, true), "deflate/tls");
        assert_eq!(TransportState::of(&compressed, true).stack, "deflate/tls");
    }

    #[tokio::test]
    async fn acknowledged_duplicate_upgrade_ends_session() {
        let (peer, local) = tokio::io::duplex(4096);
        let mut peer = BufReader::new(peer);
        peer.get_mut()
            .write_all(b"* OK [CAPABILITY IMAP4rev1 COMPRESS=DEFLATE] ready\r\n")
            .await
            .unwrap();
        let session = ImapConnection::start(local, &ImapConfig::new("h", 143))
            .await
            .unwrap();
        // The session already believes DEFLATE is on; the peer acknowledges another.
        lock(&session.shared.transport).compressed = true;
        let (installed, installed_rx) = oneshot::channel();
        let handle = session
            .submit(
                "COMPRESS DEFLATE",
                Some(PendingUpgrade {
                    transform: Transform::Deflate,
                    installed,
                }),
            )
            .await
            .unwrap();
        let mut line = String::new();
        peer.read_line(&mut line).await.unwrap();
        assert_eq!(line, "A0001 COMPRESS DEFLATE\r\n");
        peer.get_mut().write_all(b"A0001 OK\r\n").await.unwrap();

        match handle.wait().await {
            Err(ImapClientError::AlreadyActive(Transform::Deflate)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(installed_rx.await.is_err());
        assert!(!session.is_alive());
        // The pipeline was closed rather than read any further.
        line.clear();
        assert_eq!(peer.read_line(&mut line).await.unwrap(), 0);
    }
}
