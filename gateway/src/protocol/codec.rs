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

//! Telnet byte codec
//!
//! Splits a raw Telnet byte stream into complete text lines and protocol
//! events, and encodes outbound lines with CR LF line endings and IAC
//! byte-stuffing.

use crate::protocol::StreamError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single inbound line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Upper bound for a single subnegotiation payload
pub const MAX_SUBNEGOTIATION_LENGTH: usize = 8192;

const IAC: u8 = 0xFF;

/// Telnet commands the codec acts on
///
/// Anything else after an `IAC` (NOP, BRK, IP, AO, DM) is dropped while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetCommand {
    /// Interpret as command, doubled for a literal 0xFF
    Iac,
    Dont,
    Do,
    Wont,
    Will,
    /// Subnegotiation begin
    Sb,
    /// Go ahead, sent after prompts
    Ga,
    /// Erase line
    El,
    /// Erase character
    Ec,
    /// Are you there
    Ayt,
    /// Subnegotiation end
    Se,
}

impl TryFrom<u8> for TelnetCommand {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            255 => Self::Iac,
            254 => Self::Dont,
            253 => Self::Do,
            252 => Self::Wont,
            251 => Self::Will,
            250 => Self::Sb,
            249 => Self::Ga,
            248 => Self::El,
            247 => Self::Ec,
            246 => Self::Ayt,
            240 => Self::Se,
            other => return Err(other),
        })
    }
}

impl From<TelnetCommand> for u8 {
    fn from(command: TelnetCommand) -> u8 {
        match command {
            TelnetCommand::Iac => 255,
            TelnetCommand::Dont => 254,
            TelnetCommand::Do => 253,
            TelnetCommand::Wont => 252,
            TelnetCommand::Will => 251,
            TelnetCommand::Sb => 250,
            TelnetCommand::Ga => 249,
            TelnetCommand::El => 248,
            TelnetCommand::Ec => 247,
            TelnetCommand::Ayt => 246,
            TelnetCommand::Se => 240,
        }
    }
}

/// Telnet option codes the gateway knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TelnetOption {
    Echo = 1,
    SuppressGoAhead = 3,
    TerminalType = 24,
    EndOfRecord = 25,
    /// Negotiate about window size
    NAWS = 31,
    Linemode = 34,
    /// MUD Server Status Protocol
    MSSP = 70,
}

impl TelnetOption {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Echo),
            3 => Some(Self::SuppressGoAhead),
            24 => Some(Self::TerminalType),
            25 => Some(Self::EndOfRecord),
            31 => Some(Self::NAWS),
            34 => Some(Self::Linemode),
            70 => Some(Self::MSSP),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Something decoded from the client byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    /// Complete line of text, terminator removed
    Line(String),
    /// `IAC <WILL|WONT|DO|DONT> <option>`
    Negotiate(TelnetCommand, u8),
    /// `IAC SB <option> <data> IAC SE`, data unescaped
    Subnegotiate(u8, Vec<u8>),
    /// Any other recognised two byte command, e.g. `IAC AYT`
    Command(TelnetCommand),
}

/// Something to be sent to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetFrame {
    /// Text followed by CR LF
    Line(String),
    /// Text followed by `IAC GA`
    Prompt(String),
    /// Text with no terminator
    Text(String),
    Negotiate(TelnetCommand, u8),
    Subnegotiate(u8, Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Negotiate(TelnetCommand),
    SubOption,
    SubData(u8),
    SubIac(u8),
}

/// Telnet line codec
#[derive(Debug)]
pub struct TelnetCodec {
    state: State,
    line: Vec<u8>,
    sub: Vec<u8>,
    skip_lf: bool,
    max_line_length: usize,
}

impl TelnetCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            state: State::Data,
            line: Vec::new(),
            sub: Vec::new(),
            skip_lf: false,
            max_line_length,
        }
    }

    fn take_line(&mut self) -> TelnetEvent {
        TelnetEvent::Line(decode_text(&std::mem::take(&mut self.line)))
    }

    fn push_data(&mut self, byte: u8) -> Result<(), StreamError> {
        self.line.push(byte);
        if self.line.len() > self.max_line_length {
            self.line.clear();
            return Err(StreamError::LineTooLong {
                limit: self.max_line_length,
            });
        }
        Ok(())
    }

    fn step(&mut self, byte: u8) -> Result<Option<TelnetEvent>, StreamError> {
        match self.state {
            State::Data => {
                let after_cr = std::mem::replace(&mut self.skip_lf, false);
                match byte {
                    IAC => self.state = State::Iac,
                    b'\r' => {
                        self.skip_lf = true;
                        return Ok(Some(self.take_line()));
                    }
                    b'\n' | 0x00 if after_cr => {}
                    b'\n' => return Ok(Some(self.take_line())),
                    0x08 | 0x7F => erase_char(&mut self.line),
                    b'\t' => self.push_data(byte)?,
                    0x00..=0x1F => {}
                    _ => self.push_data(byte)?,
                }
            }
            State::Iac => {
                self.state = State::Data;
                match TelnetCommand::try_from(byte).ok() {
                    Some(TelnetCommand::Iac) => self.push_data(IAC)?,
                    Some(
                        cmd @ (TelnetCommand::Will
                        | TelnetCommand::Wont
                        | TelnetCommand::Do
                        | TelnetCommand::Dont),
                    ) => self.state = State::Negotiate(cmd),
                    Some(TelnetCommand::Sb) => self.state = State::SubOption,
                    Some(TelnetCommand::Ec) => erase_char(&mut self.line),
                    Some(TelnetCommand::El) => self.line.clear(),
                    Some(TelnetCommand::Se) | None => {}
                    Some(cmd) => return Ok(Some(TelnetEvent::Command(cmd))),
                }
            }
            State::Negotiate(cmd) => {
                self.state = State::Data;
                return Ok(Some(TelnetEvent::Negotiate(cmd, byte)));
            }
            State::SubOption => {
                self.sub.clear();
                self.state = State::SubData(byte);
            }
            State::SubData(option) => {
                if byte == IAC {
                    self.state = State::SubIac(option);
                } else {
                    self.push_sub(byte)?;
                }
            }
            State::SubIac(option) => match byte {
                0xF0 => {
                    self.state = State::Data;
                    let data = std::mem::take(&mut self.sub);
                    return Ok(Some(TelnetEvent::Subnegotiate(option, data)));
                }
                IAC => {
                    self.state = State::SubData(option);
                    self.push_sub(IAC)?;
                }
                // Stray command inside a subnegotiation, ignore it
                _ => self.state = State::SubData(option),
            },
        }
        Ok(None)
    }

    fn push_sub(&mut self, byte: u8) -> Result<(), StreamError> {
        self.sub.push(byte);
        if self.sub.len() > MAX_SUBNEGOTIATION_LENGTH {
            self.sub.clear();
            self.state = State::Data;
            return Err(StreamError::SubnegotiationTooLong {
                limit: MAX_SUBNEGOTIATION_LENGTH,
            });
        }
        Ok(())
    }
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for TelnetCodec {
    type Item = TelnetEvent;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            let byte = src.get_u8();
            if let Some(event) = self.step(byte)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        // Unterminated text left when the peer hung up still counts as a line
        if self.state == State::Data && !self.line.is_empty() {
            return Ok(Some(self.take_line()));
        }
        Ok(None)
    }
}

impl Encoder<TelnetFrame> for TelnetCodec {
    type Error = StreamError;

    fn encode(&mut self, frame: TelnetFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            TelnetFrame::Line(text) => {
                encode_text(text.as_bytes(), dst);
                dst.put_slice(b"\r\n");
            }
            TelnetFrame::Prompt(text) => {
                encode_text(text.as_bytes(), dst);
                dst.put_slice(&[IAC, u8::from(TelnetCommand::Ga)]);
            }
            TelnetFrame::Text(text) => encode_text(text.as_bytes(), dst),
            TelnetFrame::Negotiate(command, option) => {
                dst.put_slice(&[IAC, u8::from(command), option]);
            }
            TelnetFrame::Subnegotiate(option, data) => {
                dst.put_slice(&[IAC, u8::from(TelnetCommand::Sb), option]);
                escape_into(&data, dst);
                dst.put_slice(&[IAC, u8::from(TelnetCommand::Se)]);
            }
        }
        Ok(())
    }
}

/// Decode line bytes as UTF-8, falling back to Latin-1 for clients that do not speak it
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Remove the last UTF-8 character from a line buffer
pub fn erase_char(line: &mut Vec<u8>) {
    while let Some(byte) = line.pop() {
        if byte & 0xC0 != 0x80 {
            break;
        }
    }
}

/// Write text with bare LF promoted to CR LF and IAC doubled
fn encode_text(text: &[u8], dst: &mut BytesMut) {
    let mut previous = 0u8;
    for &byte in text {
        if byte == b'\n' && previous != b'\r' {
            dst.put_u8(b'\r');
        }
        dst.put_u8(byte);
        if byte == IAC {
            dst.put_u8(IAC);
        }
        previous = byte;
    }
}

fn escape_into(data: &[u8], dst: &mut BytesMut) {
    for &byte in data {
        dst.put_u8(byte);
        if byte == IAC {
            dst.put_u8(IAC);
        }
    }
}

/// Parse window size from NAWS subnegotiation data
pub fn parse_window_size(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() >= 4 {
        let width = u16::from_be_bytes([data[0], data[1]]);
        let height = u16::from_be_bytes([data[2], data[3]]);
        Some((width, height))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(codec: &mut TelnetCodec, bytes: &[u8]) -> Vec<TelnetEvent> {
        let mut buf = BytesMut::from(bytes);
        let mut events = Vec::new();
        while let Some(event) = codec.decode(&mut buf).unwrap() {
            events.push(event);
        }
        events
    }

    fn line(text: &str) -> TelnetEvent {
        TelnetEvent::Line(text.to_string())
    }

    #[test]
    fn test_line_terminators() {
        let mut codec = TelnetCodec::default();
        let events = decode_all(&mut codec, b"one\r\ntwo\r\0three\nfour\r");
        assert_eq!(events, vec![line("one"), line("two"), line("three"), line("four")]);
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let mut codec = TelnetCodec::default();
        assert_eq!(decode_all(&mut codec, b"look\r"), vec![line("look")]);
        assert_eq!(decode_all(&mut codec, b"\nsay hi\r\n"), vec![line("say hi")]);
    }

    #[test]
    fn test_empty_lines_are_preserved() {
        let mut codec = TelnetCodec::default();
        assert_eq!(decode_all(&mut codec, b"\r\n\r\n"), vec![line(""), line("")]);
    }

    #[test]
    fn test_escaped_iac_is_data() {
        let mut codec = TelnetCodec::default();
        let events = decode_all(&mut codec, b"say \xff\xff!\r\n");
        assert_eq!(events, vec![line("say \u{ff}!")]);
    }

    #[test]
    fn test_utf8_line() {
        let mut codec = TelnetCodec::default();
        let events = decode_all(&mut codec, "say café\r\n".as_bytes());
        assert_eq!(events, vec![line("say café")]);
    }

    #[test]
    fn test_negotiation_interleaved_with_text() {
        let mut codec = TelnetCodec::default();
        let events = decode_all(&mut codec, b"lo\xff\xfd\x03ok\r\n");
        assert_eq!(
            events,
            vec![TelnetEvent::Negotiate(TelnetCommand::Do, 3), line("look")]
        );
    }

    #[test]
    fn test_negotiation_split_across_reads() {
        let mut codec = TelnetCodec::default();
        assert!(decode_all(&mut codec, b"\xff").is_empty());
        assert!(decode_all(&mut codec, b"\xfb").is_empty());
        assert_eq!(
            decode_all(&mut codec, b"\x1f"),
            vec![TelnetEvent::Negotiate(TelnetCommand::Will, 31)]
        );
    }

    #[test]
    fn test_subnegotiation_with_escaped_iac() {
        let mut codec = TelnetCodec::default();
        let events = decode_all(&mut codec, b"\xff\xfa\x1f\x00\xff\xff\x00\x18\xff\xf0");
        assert_eq!(
            events,
            vec![TelnetEvent::Subnegotiate(31, vec![0x00, 0xFF, 0x00, 0x18])]
        );
        assert_eq!(parse_window_size(&[0x00, 0xFF, 0x00, 0x18]), Some((255, 24)));
    }

    #[test]
    fn test_erase_character_and_line() {
        let mut codec = TelnetCodec::default();
        let events = decode_all(&mut codec, b"lookk\x08\r\nxyz\xff\xf8north\x7fh\r\n");
        assert_eq!(events, vec![line("look"), line("north")]);

        let mut codec = TelnetCodec::default();
        let events = decode_all(&mut codec, "caf\u{e9}\x08e\r\n".as_bytes());
        assert_eq!(events, vec![line("cafe")]);
    }

    #[test]
    fn test_control_bytes_are_dropped() {
        let mut codec = TelnetCodec::default();
        let events = decode_all(&mut codec, b"lo\x07ok\tnow\r\n");
        assert_eq!(events, vec![line("look\tnow")]);
    }

    #[test]
    fn test_commands_are_reported() {
        let mut codec = TelnetCodec::default();
        // NOP and BRK are dropped, AYT and GA are passed on
        let events = decode_all(&mut codec, b"\xff\xf1\xff\xf6\xff\xf3\xff\xf9ok\r\n");
        assert_eq!(
            events,
            vec![
                TelnetEvent::Command(TelnetCommand::Ayt),
                TelnetEvent::Command(TelnetCommand::Ga),
                line("ok"),
            ]
        );
    }

    #[test]
    fn test_line_too_long() {
        let mut codec = TelnetCodec::new(8);
        let mut buf = BytesMut::from(&b"123456789\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(StreamError::LineTooLong { limit: 8 })
        ));
    }

    #[test]
    fn test_subnegotiation_too_long() {
        let mut codec = TelnetCodec::default();
        let mut bytes = vec![0xFF, 0xFA, 24];
        bytes.extend(std::iter::repeat_n(b'x', MAX_SUBNEGOTIATION_LENGTH + 1));
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(StreamError::SubnegotiationTooLong { .. })
        ));
    }

    #[test]
    fn test_unterminated_line_at_eof() {
        let mut codec = TelnetCodec::default();
        let mut buf = BytesMut::from(&b"quit"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(line("quit")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_line_and_prompt() {
        let mut codec = TelnetCodec::default();
        let mut out = BytesMut::new();
        codec
            .encode(TelnetFrame::Line("A dark room.".to_string()), &mut out)
            .unwrap();
        codec
            .encode(TelnetFrame::Prompt("> ".to_string()), &mut out)
            .unwrap();
        assert_eq!(&out[..], b"A dark room.\r\n> \xff\xf9");
    }

    #[test]
    fn test_encode_promotes_bare_newlines() {
        let mut codec = TelnetCodec::default();
        let mut out = BytesMut::new();
        codec
            .encode(TelnetFrame::Line("one\ntwo\r\nthree".to_string()), &mut out)
            .unwrap();
        assert_eq!(&out[..], b"one\r\ntwo\r\nthree\r\n");
    }

    #[test]
    fn test_encode_negotiation_and_subnegotiation() {
        let mut codec = TelnetCodec::default();
        let mut out = BytesMut::new();
        codec
            .encode(
                TelnetFrame::Negotiate(TelnetCommand::Will, TelnetOption::MSSP.to_byte()),
                &mut out,
            )
            .unwrap();
        codec
            .encode(TelnetFrame::Subnegotiate(70, vec![1, 0xFF, 2]), &mut out)
            .unwrap();
        assert_eq!(
            &out[..],
            &[0xFF, 0xFB, 70, 0xFF, 0xFA, 70, 1, 0xFF, 0xFF, 2, 0xFF, 0xF0]
        );
    }

    proptest! {
        #[test]
        fn prop_iac_stuffing_is_reversed(
            bytes in proptest::collection::vec(0x20u8..=0xFF, 0..128)
                .prop_filter("no DEL", |b| !b.contains(&0x7F))
        ) {
            let mut wire = BytesMut::new();
            escape_into(&bytes, &mut wire);
            wire.put_slice(b"\r\n");

            let mut codec = TelnetCodec::default();
            let event = codec.decode(&mut wire).unwrap();
            prop_assert_eq!(event, Some(TelnetEvent::Line(decode_text(&bytes))));
            prop_assert!(wire.is_empty() || codec.decode(&mut wire).unwrap().is_none());
        }
    }
}
