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

//! MudLink Gateway Library
//!
//! Accepts Telnet, Telnet over TLS and SSH clients, turns each into a
//! session, and relays their lines to the game engine over a single
//! WebSocket that survives engine restarts.

pub mod config;
pub mod context;
pub mod engine;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use context::ServerContext;
pub use engine::{ChannelState, EngineBridge, EngineSettings, QueueStats, SessionRoster};
pub use router::Router;
pub use session::registry::{Outbound, SessionHandle, SessionRegistry};
pub use session::{Session, SessionState};
