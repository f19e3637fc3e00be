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

//! Mudlink Common Types
//!
//! This crate defines the wire format shared between the gateway and the game engine:
//! - Engine envelopes (one JSON object per WebSocket text frame)
//! - Session announcements and gateway system events

pub mod envelope;
pub mod session;

pub use envelope::{Directive, Envelope, EnvelopeError, EnvelopeKind, SessionId};
pub use session::{SessionAnnouncement, SessionOption, SystemEvent, TransportKind};
