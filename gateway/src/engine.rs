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

//! Engine channel with automatic reconnection and envelope queuing
//!
//! The gateway keeps exactly one WebSocket to the game engine. Every
//! envelope bound for the engine goes through a bounded pending queue which
//! the connection task drains, so ordering is the same whether the engine
//! is up or in the middle of a softboot.

mod bridge;

pub use bridge::{BridgeError, ChannelState, EngineBridge, EngineSettings, QueueStats};

use async_trait::async_trait;
use mudlink_common::{SessionAnnouncement, SessionId};

/// View of the live sessions needed by the engine channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionRoster: Send + Sync {
    /// Announcements for every live session, used for resync
    async fn announcements(&self) -> Vec<SessionAnnouncement>;

    /// Whether the session is still registered
    async fn is_registered(&self, id: SessionId) -> bool;

    /// Number of registered sessions
    async fn count(&self) -> usize;
}
