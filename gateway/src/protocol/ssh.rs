//
// Copyright 2025-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! SSH channel to line stream adapter
//!
//! The SSH client is a raw terminal, so the gateway performs line editing
//! itself: printable input is echoed, backspace erases, and CR or LF
//! completes a line.

use crate::protocol::codec::{DEFAULT_MAX_LINE_LENGTH, decode_text, erase_char};
use crate::protocol::{LineStream, StreamError};
use async_trait::async_trait;
use mudlink_common::{SessionOption, TransportKind};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long `close` waits for the SSH connection to wind down
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const ERASE: &[u8] = b"\x08 \x08";
const NEWLINE: &[u8] = b"\r\n";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    None,
    Start,
    Sequence,
}

/// Result of feeding raw terminal input to a [`LineEditor`]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Edit {
    /// Bytes to send back to the terminal
    pub echo: Vec<u8>,
    /// Lines completed by this input
    pub lines: Vec<String>,
    /// Ctrl-D on an empty line
    pub end_of_input: bool,
    /// The current line grew past the limit; input after it was ignored
    pub overflow: bool,
}

/// Server-side line editor for character-at-a-time terminals
#[derive(Debug)]
pub struct LineEditor {
    buffer: Vec<u8>,
    skip_lf: bool,
    escape: Escape,
    max_line: usize,
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl LineEditor {
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            skip_lf: false,
            escape: Escape::None,
            max_line,
        }
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }

    pub fn feed(&mut self, data: &[u8], echo: bool) -> Edit {
        let mut edit = Edit::default();
        for &byte in data {
            let after_cr = std::mem::replace(&mut self.skip_lf, false);

            // Swallow terminal escape sequences such as arrow keys
            match self.escape {
                Escape::Start => {
                    self.escape = if byte == b'[' || byte == b'O' {
                        Escape::Sequence
                    } else {
                        Escape::None
                    };
                    continue;
                }
                Escape::Sequence => {
                    if (0x40..=0x7E).contains(&byte) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::None => {}
            }

            match byte {
                b'\r' => {
                    self.skip_lf = true;
                    edit.echo.extend_from_slice(NEWLINE);
                    edit.lines.push(decode_text(&std::mem::take(&mut self.buffer)));
                }
                b'\n' | 0x00 if after_cr => {}
                b'\n' => {
                    edit.echo.extend_from_slice(NEWLINE);
                    edit.lines.push(decode_text(&std::mem::take(&mut self.buffer)));
                }
                0x08 | 0x7F => {
                    if !self.buffer.is_empty() {
                        erase_char(&mut self.buffer);
                        if echo {
                            edit.echo.extend_from_slice(ERASE);
                        }
                    }
                }
                0x03 => {
                    self.buffer.clear();
                    edit.echo.extend_from_slice(b"^C\r\n");
                }
                0x04 if self.buffer.is_empty() => {
                    edit.end_of_input = true;
                    break;
                }
                0x1B => self.escape = Escape::Start,
                b'\t' | 0x20.. => {
                    if self.buffer.len() >= self.max_line {
                        self.buffer.clear();
                        edit.overflow = true;
                        break;
                    }
                    self.buffer.push(byte);
                    if echo {
                        edit.echo.push(byte);
                    }
                }
                _ => {}
            }
        }
        edit
    }
}

/// Interactive channel handed over once the client requests a shell
pub struct SshChannel {
    pub handle: Handle,
    pub channel: ChannelId,
    pub window: Option<(u16, u16)>,
    pub pty: bool,
}

/// Per-connection russh handler
///
/// Authentication is transport level only and every client is admitted.
pub struct SshHandler {
    peer: SocketAddr,
    channel: Option<ChannelId>,
    ready: Option<oneshot::Sender<SshChannel>>,
    lines: Option<mpsc::UnboundedSender<Result<String, StreamError>>>,
    editor: LineEditor,
    echo: Arc<AtomicBool>,
    window: Option<(u16, u16)>,
    pty: bool,
}

impl SshHandler {
    pub fn new(
        peer: SocketAddr,
        ready: oneshot::Sender<SshChannel>,
        lines: mpsc::UnboundedSender<Result<String, StreamError>>,
        echo: Arc<AtomicBool>,
        max_line: usize,
    ) -> Self {
        Self {
            peer,
            channel: None,
            ready: Some(ready),
            lines: Some(lines),
            editor: LineEditor::new(max_line),
            echo,
            window: None,
            pty: false,
        }
    }

    fn end_of_input(&mut self, channel: ChannelId) {
        if self.channel == Some(channel) {
            self.lines = None;
        }
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(peer = %self.peer, "SSH user {} admitted", user);
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(peer = %self.peer, "SSH user {} admitted with password", user);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() {
            tracing::debug!(peer = %self.peer, "Refusing second SSH session channel");
            return Ok(false);
        }
        self.channel = Some(channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty = true;
        self.window = Some((
            u16::try_from(col_width).unwrap_or(u16::MAX),
            u16::try_from(row_height).unwrap_or(u16::MAX),
        ));
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel != Some(channel) {
            session.channel_failure(channel);
            return Ok(());
        }
        if let Some(ready) = self.ready.take() {
            let handoff = ready.send(SshChannel {
                handle: session.handle(),
                channel,
                window: self.window,
                pty: self.pty,
            });
            if handoff.is_err() {
                tracing::trace!(peer = %self.peer, "Shell requested after the login window closed");
            }
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel != Some(channel) {
            return Ok(());
        }
        let edit = self.editor.feed(data, self.echo.load(Ordering::Relaxed));
        if !edit.echo.is_empty() {
            session.data(channel, CryptoVec::from_slice(&edit.echo));
        }
        if let Some(lines) = &self.lines {
            for line in edit.lines {
                if lines.send(Ok(line)).is_err() {
                    tracing::trace!(peer = %self.peer, "SSH line dropped, session already gone");
                }
            }
            if edit.overflow {
                let limit = self.editor.max_line();
                tracing::warn!(peer = %self.peer, "SSH input line exceeded {} bytes", limit);
                if lines.send(Err(StreamError::LineTooLong { limit })).is_err() {
                    tracing::trace!(peer = %self.peer, "SSH overflow not delivered, session already gone");
                }
            }
        }
        if edit.end_of_input || edit.overflow {
            self.end_of_input(channel);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.end_of_input(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.end_of_input(channel);
        Ok(())
    }
}

/// Line stream over an SSH interactive channel
pub struct SshStream {
    handle: Handle,
    channel: ChannelId,
    lines: mpsc::UnboundedReceiver<Result<String, StreamError>>,
    echo: Arc<AtomicBool>,
    window: Option<(u16, u16)>,
    pty: bool,
    driver: Option<JoinHandle<Result<(), russh::Error>>>,
}

impl SshStream {
    pub fn new(
        channel: SshChannel,
        lines: mpsc::UnboundedReceiver<Result<String, StreamError>>,
        echo: Arc<AtomicBool>,
        driver: JoinHandle<Result<(), russh::Error>>,
    ) -> Self {
        Self {
            handle: channel.handle,
            channel: channel.channel,
            lines,
            echo,
            window: channel.window,
            pty: channel.pty,
            driver: Some(driver),
        }
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), StreamError> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(&bytes))
            .await
            .map_err(|_| StreamError::Closed)
    }
}

/// Terminal text with every line ending as CR LF
fn terminal_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    let mut previous = 0u8;
    for &byte in text.as_bytes() {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}

#[async_trait]
impl LineStream for SshStream {
    fn transport(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn options(&self) -> BTreeSet<SessionOption> {
        let mut options = BTreeSet::new();
        if self.pty {
            options.insert(SessionOption::Pty);
        }
        if self.window.is_some() {
            options.insert(SessionOption::WindowSize);
        }
        if !self.echo.load(Ordering::Relaxed) {
            options.insert(SessionOption::ServerEcho);
        }
        options
    }

    fn window_size(&self) -> Option<(u16, u16)> {
        self.window
    }

    async fn read_line(&mut self) -> Result<Option<String>, StreamError> {
        self.lines.recv().await.transpose()
    }

    async fn write_line(&mut self, text: &str) -> Result<(), StreamError> {
        let mut bytes = terminal_text(text);
        bytes.extend_from_slice(NEWLINE);
        self.send(bytes).await
    }

    async fn write_prompt(&mut self, text: &str) -> Result<(), StreamError> {
        self.send(terminal_text(text)).await
    }

    async fn set_echo(&mut self, visible: bool) -> Result<(), StreamError> {
        self.echo.store(visible, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
        if let Some(driver) = self.driver.take() {
            let abort = driver.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, driver).await.is_err() {
                abort.abort();
            }
        }
        Ok(())
    }
}

impl Drop for SshStream {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_with_echo() {
        let mut editor = LineEditor::default();
        let edit = editor.feed(b"look\r", true);
        assert_eq!(edit.lines, vec!["look".to_string()]);
        assert_eq!(edit.echo, b"look\r\n".to_vec());
        assert!(!edit.end_of_input);
    }

    #[test]
    fn test_crlf_and_split_input() {
        let mut editor = LineEditor::default();
        assert!(editor.feed(b"no", true).lines.is_empty());
        let edit = editor.feed(b"rth\r\nsouth\n", true);
        assert_eq!(edit.lines, vec!["north".to_string(), "south".to_string()]);
    }

    #[test]
    fn test_backspace_erases_characters() {
        let mut editor = LineEditor::default();
        let edit = editor.feed("cafe\u{301}x\x7f\x7f\x7f\r".as_bytes(), true);
        assert_eq!(edit.lines, vec!["caf".to_string()]);
        assert!(edit.echo.ends_with(b"\x08 \x08\r\n"));

        // Backspace on an empty line is silent
        let edit = editor.feed(b"\x08", true);
        assert!(edit.echo.is_empty());
    }

    #[test]
    fn test_hidden_input_still_ends_lines() {
        let mut editor = LineEditor::default();
        let edit = editor.feed(b"hunter2\r", false);
        assert_eq!(edit.lines, vec!["hunter2".to_string()]);
        assert_eq!(edit.echo, b"\r\n".to_vec());
    }

    #[test]
    fn test_escape_sequences_are_ignored() {
        let mut editor = LineEditor::default();
        let edit = editor.feed(b"\x1b[Aup\x1bOB\r", true);
        assert_eq!(edit.lines, vec!["up".to_string()]);
    }

    #[test]
    fn test_ctrl_c_and_ctrl_d() {
        let mut editor = LineEditor::default();
        let edit = editor.feed(b"oops\x03", true);
        assert!(edit.lines.is_empty());
        assert!(edit.echo.ends_with(b"^C\r\n"));

        // Ctrl-D only ends input on an empty line
        let edit = editor.feed(b"a\x04", true);
        assert!(!edit.end_of_input);
        let edit = editor.feed(b"\r\x04ignored", true);
        assert_eq!(edit.lines, vec!["a".to_string()]);
        assert!(edit.end_of_input);
    }

    #[test]
    fn test_overlong_line_is_reported() {
        let mut editor = LineEditor::new(4);
        let edit = editor.feed(b"ok\rtoolong\r", true);
        assert_eq!(edit.lines, vec!["ok".to_string()]);
        assert!(edit.overflow);

        // A line exactly at the limit is accepted
        let mut editor = LineEditor::new(4);
        let edit = editor.feed(b"look\r", true);
        assert_eq!(edit.lines, vec!["look".to_string()]);
        assert!(!edit.overflow);
    }

    #[test]
    fn test_terminal_text() {
        assert_eq!(terminal_text("a\nb\r\nc"), b"a\r\nb\r\nc".to_vec());
    }
}
