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

use crate::config::{MsspConfig, SessionConfig};
use crate::engine::{EngineBridge, EngineSettings};
use crate::protocol::mssp::MsspResponder;
use crate::router::Router;
use crate::session::registry::SessionRegistry;
use mudlink_common::Envelope;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Server context containing shared resources
#[derive(Clone)]
pub struct ServerContext {
    /// Live sessions
    pub registry: Arc<SessionRegistry>,

    /// Channel to the game engine
    pub bridge: Arc<EngineBridge>,

    /// Session pump and engine dispatch
    pub router: Arc<Router>,

    /// MSSP record builder
    pub mssp: Arc<MsspResponder>,

    /// Session timeouts and limits
    pub session: SessionConfig,

    /// Cancelled once on shutdown
    pub shutdown: CancellationToken,
}

impl ServerContext {
    /// Create a new server context
    ///
    /// Returns the receiver of engine envelopes, to be handed to
    /// [`Router::run`].
    pub fn new(
        engine: EngineSettings,
        session: SessionConfig,
        mssp: &MsspConfig,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let registry = Arc::new(SessionRegistry::new());
        let (bridge, inbound) = EngineBridge::new(engine, registry.clone(), shutdown.clone());
        let router = Arc::new(Router::new(
            registry.clone(),
            bridge.clone(),
            shutdown.clone(),
            session.shutdown_grace(),
        ));
        let mssp = Arc::new(MsspResponder::new(
            mssp.name.clone(),
            mssp.fields.clone(),
            registry.players(),
        ));

        let context = Self {
            registry,
            bridge,
            router,
            mssp,
            session,
            shutdown,
        };
        (context, inbound)
    }

    /// Get the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the engine bridge
    pub fn bridge(&self) -> &Arc<EngineBridge> {
        &self.bridge
    }

    /// Get the router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn mssp(&self) -> &Arc<MsspResponder> {
        &self.mssp
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}
