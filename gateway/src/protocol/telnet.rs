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

//! Telnet option negotiation and line stream
//!
//! [`TelnetStream`] is generic over the byte stream so the same code serves
//! plain TCP and TLS wrapped connections.

use crate::protocol::codec::{
    TelnetCodec, TelnetCommand, TelnetEvent, TelnetFrame, TelnetOption, parse_window_size,
};
use crate::protocol::mssp::MsspResponder;
use crate::protocol::{LineStream, StreamError};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use metrics::counter;
use mudlink_common::{SessionOption, TransportKind};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Encoder, FramedRead};

/// LINEMODE subnegotiation `MODE` command
const LINEMODE_MODE: u8 = 1;
/// LINEMODE `EDIT` mode bit, the client edits lines locally
const LINEMODE_EDIT: u8 = 1;

#[derive(Debug, Default, Clone, Copy)]
struct OptionState {
    enabled: bool,
    /// We asked and are waiting for the answer
    pending: bool,
    /// Already declined, repeats of the request are ignored
    refused: bool,
}

/// Result of a single inbound negotiation
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Negotiated {
    pub replies: Vec<TelnetFrame>,
    /// The client asked for the MSSP record
    pub mssp_requested: bool,
}

/// Per-connection option state
///
/// Replies are only produced when an option actually changes state, so
/// acknowledgements of our own offers are never answered again.
#[derive(Debug, Default)]
pub struct OptionTable {
    local: HashMap<u8, OptionState>,
    remote: HashMap<u8, OptionState>,
    hide_input: bool,
    window: Option<(u16, u16)>,
}

impl OptionTable {
    /// Negotiations sent as soon as a connection is accepted
    pub fn opening(&mut self) -> Vec<TelnetFrame> {
        let mut frames = Vec::new();
        for option in [TelnetOption::SuppressGoAhead, TelnetOption::MSSP] {
            self.local.entry(option.to_byte()).or_default().pending = true;
        }
        for option in [TelnetOption::NAWS, TelnetOption::Linemode] {
            self.remote.entry(option.to_byte()).or_default().pending = true;
        }
        frames.push(TelnetFrame::Negotiate(
            TelnetCommand::Will,
            TelnetOption::SuppressGoAhead.to_byte(),
        ));
        frames.push(TelnetFrame::Negotiate(
            TelnetCommand::Wont,
            TelnetOption::Echo.to_byte(),
        ));
        frames.push(TelnetFrame::Negotiate(
            TelnetCommand::Will,
            TelnetOption::MSSP.to_byte(),
        ));
        frames.push(TelnetFrame::Negotiate(
            TelnetCommand::Do,
            TelnetOption::NAWS.to_byte(),
        ));
        frames.push(TelnetFrame::Negotiate(
            TelnetCommand::Do,
            TelnetOption::Linemode.to_byte(),
        ));
        frames
    }

    fn supports_local(&self, option: u8) -> bool {
        match TelnetOption::from_byte(option) {
            Some(TelnetOption::SuppressGoAhead | TelnetOption::MSSP) => true,
            Some(TelnetOption::Echo) => self.hide_input,
            _ => false,
        }
    }

    fn supports_remote(&self, option: u8) -> bool {
        matches!(
            TelnetOption::from_byte(option),
            Some(TelnetOption::NAWS | TelnetOption::Linemode)
        )
    }

    /// Apply an inbound `WILL`/`WONT`/`DO`/`DONT`
    pub fn receive(&mut self, command: TelnetCommand, option: u8) -> Negotiated {
        let mut result = Negotiated::default();
        match command {
            TelnetCommand::Do => {
                let supported = self.supports_local(option);
                let state = self.local.entry(option).or_default();
                let pending = std::mem::take(&mut state.pending);
                if supported {
                    state.refused = false;
                    if !state.enabled {
                        state.enabled = true;
                        if !pending {
                            result
                                .replies
                                .push(TelnetFrame::Negotiate(TelnetCommand::Will, option));
                        }
                    }
                    result.mssp_requested = option == TelnetOption::MSSP.to_byte();
                } else if !state.refused {
                    state.enabled = false;
                    state.refused = true;
                    result
                        .replies
                        .push(TelnetFrame::Negotiate(TelnetCommand::Wont, option));
                }
            }
            TelnetCommand::Dont => {
                let state = self.local.entry(option).or_default();
                let pending = std::mem::take(&mut state.pending);
                if state.enabled {
                    state.enabled = false;
                    if !pending {
                        result
                            .replies
                            .push(TelnetFrame::Negotiate(TelnetCommand::Wont, option));
                    }
                }
            }
            TelnetCommand::Will => {
                let supported = self.supports_remote(option);
                let state = self.remote.entry(option).or_default();
                let pending = std::mem::take(&mut state.pending);
                if supported {
                    state.refused = false;
                    if !state.enabled {
                        state.enabled = true;
                        if !pending {
                            result
                                .replies
                                .push(TelnetFrame::Negotiate(TelnetCommand::Do, option));
                        }
                        if option == TelnetOption::Linemode.to_byte() {
                            result.replies.push(TelnetFrame::Subnegotiate(
                                option,
                                vec![LINEMODE_MODE, LINEMODE_EDIT],
                            ));
                        }
                    }
                } else if !state.refused {
                    state.refused = true;
                    result
                        .replies
                        .push(TelnetFrame::Negotiate(TelnetCommand::Dont, option));
                }
            }
            TelnetCommand::Wont => {
                let state = self.remote.entry(option).or_default();
                let pending = std::mem::take(&mut state.pending);
                if state.enabled {
                    state.enabled = false;
                    if !pending {
                        result
                            .replies
                            .push(TelnetFrame::Negotiate(TelnetCommand::Dont, option));
                    }
                }
            }
            _ => {}
        }
        result
    }

    /// Apply an inbound subnegotiation
    pub fn subnegotiation(&mut self, option: u8, data: &[u8]) {
        if option == TelnetOption::NAWS.to_byte() {
            if let Some(size) = parse_window_size(data) {
                self.window = Some(size);
            }
        }
    }

    /// Hide or show client input by claiming or releasing the ECHO option
    pub fn set_echo(&mut self, visible: bool) -> Vec<TelnetFrame> {
        let echo = TelnetOption::Echo.to_byte();
        self.hide_input = !visible;
        let state = self.local.entry(echo).or_default();
        if visible {
            if state.enabled || state.pending {
                *state = OptionState::default();
                return vec![TelnetFrame::Negotiate(TelnetCommand::Wont, echo)];
            }
        } else if !state.enabled && !state.pending {
            state.pending = true;
            return vec![TelnetFrame::Negotiate(TelnetCommand::Will, echo)];
        }
        Vec::new()
    }

    fn local_enabled(&self, option: TelnetOption) -> bool {
        self.local
            .get(&option.to_byte())
            .is_some_and(|state| state.enabled)
    }

    fn remote_enabled(&self, option: TelnetOption) -> bool {
        self.remote
            .get(&option.to_byte())
            .is_some_and(|state| state.enabled)
    }

    pub fn window_size(&self) -> Option<(u16, u16)> {
        self.window
    }

    pub fn options(&self) -> BTreeSet<SessionOption> {
        let mut options = BTreeSet::new();
        if self.local_enabled(TelnetOption::SuppressGoAhead) {
            options.insert(SessionOption::SuppressGoAhead);
        }
        if self.local_enabled(TelnetOption::Echo) {
            options.insert(SessionOption::ServerEcho);
        }
        if self.local_enabled(TelnetOption::MSSP) {
            options.insert(SessionOption::Mssp);
        }
        if self.remote_enabled(TelnetOption::Linemode) {
            options.insert(SessionOption::LineMode);
        }
        if self.remote_enabled(TelnetOption::NAWS) || self.window.is_some() {
            options.insert(SessionOption::WindowSize);
        }
        options
    }
}

/// Outcome of the opening negotiation window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// A player; hand the stream to the session registry
    Session,
    /// A status crawler that has been answered and should be disconnected
    MsspProbe,
}

/// Telnet line stream over any async byte stream
pub struct TelnetStream<S> {
    reader: FramedRead<ReadHalf<S>, TelnetCodec>,
    writer: WriteHalf<S>,
    out: BytesMut,
    table: OptionTable,
    mssp: Arc<MsspResponder>,
    transport: TransportKind,
    pending_lines: VecDeque<String>,
}

impl<S> TelnetStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        transport: TransportKind,
        mssp: Arc<MsspResponder>,
        max_line_length: usize,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(read_half, TelnetCodec::new(max_line_length)),
            writer: write_half,
            out: BytesMut::new(),
            table: OptionTable::default(),
            mssp,
            transport,
            pending_lines: VecDeque::new(),
        }
    }

    fn queue(&mut self, frame: TelnetFrame) -> Result<(), StreamError> {
        self.reader.decoder_mut().encode(frame, &mut self.out)
    }

    /// Write out everything queued
    ///
    /// `write_all_buf` advances `out` as bytes are written, so a cancelled
    /// flush resumes where it stopped on the next call.
    async fn flush(&mut self) -> Result<(), StreamError> {
        if !self.out.is_empty() {
            self.writer.write_all_buf(&mut self.out).await?;
            self.writer.flush().await?;
        }
        Ok(())
    }

    /// Apply a negotiation, queueing replies; returns true if MSSP was sent
    fn negotiate_option(&mut self, command: TelnetCommand, option: u8) -> Result<bool, StreamError> {
        let negotiated = self.table.receive(command, option);
        for reply in negotiated.replies {
            self.queue(reply)?;
        }
        if negotiated.mssp_requested {
            let payload = self.mssp.telnet_payload();
            self.queue(TelnetFrame::Subnegotiate(TelnetOption::MSSP.to_byte(), payload))?;
            counter!("gateway_mssp_responses_total", "format" => "telnet").increment(1);
        }
        Ok(negotiated.mssp_requested)
    }

    fn apply_event(&mut self, event: TelnetEvent) -> Result<Option<String>, StreamError> {
        match event {
            TelnetEvent::Line(line) => return Ok(Some(line)),
            TelnetEvent::Negotiate(command, option) => {
                self.negotiate_option(command, option)?;
            }
            TelnetEvent::Subnegotiate(option, data) => self.table.subnegotiation(option, &data),
            TelnetEvent::Command(TelnetCommand::Ayt) => {
                self.queue(TelnetFrame::Line("[Yes]".to_string()))?;
            }
            TelnetEvent::Command(command) => {
                tracing::trace!("Ignoring telnet command {:?}", command);
            }
        }
        Ok(None)
    }

    /// Run the opening negotiation window
    ///
    /// A line typed inside the window ends it early and is kept as the
    /// session's first input. A peer that hangs up inside the window never
    /// becomes a session.
    pub async fn negotiate(&mut self, window: Duration) -> Result<Handshake, StreamError> {
        let deadline = tokio::time::Instant::now() + window;
        for frame in self.table.opening() {
            self.queue(frame)?;
        }
        self.flush().await?;

        let mut mssp_sent = false;
        let mut engaged = false;
        loop {
            let next = match tokio::time::timeout_at(deadline, self.reader.next()).await {
                Ok(next) => next,
                Err(_) => break,
            };
            match next {
                None => {
                    return if mssp_sent {
                        Ok(Handshake::MsspProbe)
                    } else {
                        Err(StreamError::Closed)
                    };
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(TelnetEvent::Line(line))) => {
                    if MsspResponder::is_plaintext_request(&line) {
                        let reply = self.mssp.plaintext();
                        self.queue(TelnetFrame::Text(reply))?;
                        self.flush().await?;
                        counter!("gateway_mssp_responses_total", "format" => "plaintext")
                            .increment(1);
                        return Ok(Handshake::MsspProbe);
                    }
                    self.pending_lines.push_back(line);
                    engaged = true;
                    break;
                }
                Some(Ok(TelnetEvent::Negotiate(command, option))) => {
                    let mssp = option == TelnetOption::MSSP.to_byte();
                    if !(command == TelnetCommand::Do && mssp) {
                        engaged = true;
                    }
                    mssp_sent |= self.negotiate_option(command, option)?;
                    self.flush().await?;
                }
                Some(Ok(event)) => {
                    engaged = true;
                    self.apply_event(event)?;
                    self.flush().await?;
                }
            }
        }

        if mssp_sent && !engaged {
            Ok(Handshake::MsspProbe)
        } else {
            Ok(Handshake::Session)
        }
    }
}

#[async_trait]
impl<S> LineStream for TelnetStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn options(&self) -> BTreeSet<SessionOption> {
        self.table.options()
    }

    fn window_size(&self) -> Option<(u16, u16)> {
        self.table.window_size()
    }

    async fn read_line(&mut self) -> Result<Option<String>, StreamError> {
        if let Some(line) = self.pending_lines.pop_front() {
            return Ok(Some(line));
        }
        loop {
            self.flush().await?;
            match self.reader.next().await {
                None => return Ok(None),
                Some(Err(err)) => return Err(err),
                Some(Ok(event)) => {
                    if let Some(line) = self.apply_event(event)? {
                        return Ok(Some(line));
                    }
                }
            }
        }
    }

    async fn write_line(&mut self, text: &str) -> Result<(), StreamError> {
        self.queue(TelnetFrame::Line(text.to_string()))?;
        self.flush().await
    }

    async fn write_prompt(&mut self, text: &str) -> Result<(), StreamError> {
        self.queue(TelnetFrame::Prompt(text.to_string()))?;
        self.flush().await
    }

    async fn set_echo(&mut self, visible: bool) -> Result<(), StreamError> {
        for frame in self.table.set_echo(visible) {
            self.queue(frame)?;
        }
        self.flush().await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
