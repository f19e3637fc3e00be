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

//! Routing between client sessions and the engine
//!
//! Each live session is pumped by [`Router::serve`] on its own task, while a
//! single [`Router::run`] task applies envelopes arriving from the engine.

use crate::engine::EngineBridge;
use crate::protocol::{LineStream, StreamError};
use crate::session::registry::{Outbound, SessionHandle, SessionRegistry};
use metrics::counter;
use mudlink_common::{Directive, Envelope, EnvelopeKind, SessionId, SystemEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub struct Router {
    registry: Arc<SessionRegistry>,
    bridge: Arc<EngineBridge>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bridge: Arc<EngineBridge>,
        shutdown: CancellationToken,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            bridge,
            shutdown,
            grace,
        }
    }

    /// Run one session from handshake success to removal
    pub async fn serve(&self, mut stream: Box<dyn LineStream>, peer: SocketAddr) {
        let transport = stream.transport();
        let (id, mut outbound) = self
            .registry
            .create(transport, peer, stream.options(), stream.window_size())
            .await;
        tracing::info!(session_id = %id, %peer, %transport, "Session opened");

        if let Some(session) = self.registry.get(id).await {
            match Envelope::session_opened(&session.announcement()) {
                Ok(envelope) => self.bridge.send(envelope).await,
                Err(err) => tracing::error!(session_id = %id, "Unable to announce session: {}", err),
            }
        }

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break "gateway shutting down",
                command = outbound.recv() => match command {
                    Some(Outbound::Close) | None => break "closed by engine",
                    Some(command) => {
                        if let Err(err) = self.apply(id, stream.as_mut(), command).await {
                            tracing::debug!(session_id = %id, "Write failed: {}", err);
                            break "transport error";
                        }
                    }
                },
                line = stream.read_line() => match line {
                    Ok(Some(line)) => {
                        self.registry.touch(id).await;
                        self.bridge.send(Envelope::input_line(id, line)).await;
                    }
                    Ok(None) => break "client disconnected",
                    Err(err) => {
                        tracing::debug!(session_id = %id, "Read failed: {}", err);
                        break "transport error";
                    }
                },
            }
        };

        self.registry.mark_closing(id).await;

        let flush = async {
            while let Ok(command) = outbound.try_recv() {
                if command == Outbound::Close {
                    continue;
                }
                self.apply(id, stream.as_mut(), command).await?;
            }
            stream.close().await
        };
        match timeout(self.grace, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(session_id = %id, "Flush on close failed: {}", err),
            Err(_) => tracing::warn!(session_id = %id, "Flush on close timed out"),
        }

        self.registry.remove(id).await;
        self.bridge.send(Envelope::session_closed(id)).await;
        tracing::info!(session_id = %id, %peer, "Session closed: {}", reason);
    }

    async fn apply(
        &self,
        id: SessionId,
        stream: &mut dyn LineStream,
        command: Outbound,
    ) -> Result<(), StreamError> {
        match command {
            Outbound::Line(text) => stream.write_line(&text).await,
            Outbound::Prompt(text) => stream.write_prompt(&text).await,
            Outbound::Echo(visible) => {
                stream.set_echo(visible).await?;
                self.registry.set_options(id, stream.options()).await;
                Ok(())
            }
            Outbound::Close => Ok(()),
        }
    }

    /// Apply envelopes from the engine in arrival order until shutdown
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Router stopped");
    }

    /// Apply one envelope from the engine
    pub async fn dispatch(&self, envelope: Envelope) {
        match (envelope.kind, envelope.session_id) {
            (EnvelopeKind::OutputLine, Some(id)) => {
                let Some(handle) = self.resolve(id).await else {
                    return;
                };
                let result = match envelope.directive {
                    Some(Directive::Prompt) => handle.write_prompt(envelope.payload),
                    _ => handle.write_line(envelope.payload),
                };
                if let Err(err) = result {
                    tracing::debug!("{}", err);
                }
            }
            (EnvelopeKind::OutputLine, None) => self.broadcast(envelope).await,
            (EnvelopeKind::System, Some(id)) => self.control(id, envelope).await,
            (EnvelopeKind::System, None) => match envelope.system_event() {
                Ok(SystemEvent::Heartbeat { sessions }) => {
                    tracing::debug!("Engine heartbeat, {} sessions", sessions);
                }
                Ok(event) => tracing::info!("Engine system event: {:?}", event),
                Err(err) => tracing::warn!("Unreadable engine system event: {}", err),
            },
            (EnvelopeKind::SessionClosed, Some(id)) => {
                tracing::debug!(session_id = %id, "Engine closed session");
                self.registry.close(id).await;
            }
            (EnvelopeKind::SessionClosed, None) => {
                tracing::warn!("Dropping session-closed without a session id");
            }
            (kind @ (EnvelopeKind::InputLine | EnvelopeKind::SessionOpened), _) => {
                counter!("gateway_engine_protocol_errors_total").increment(1);
                tracing::warn!("Engine sent {:?}, which only the gateway may send; dropped", kind);
            }
        }
    }

    async fn resolve(&self, id: SessionId) -> Option<SessionHandle> {
        let handle = self.registry.lookup(id).await;
        if handle.is_none() {
            counter!("gateway_engine_unroutable_total").increment(1);
            tracing::warn!(session_id = %id, "Dropping engine envelope for unknown session");
        }
        handle
    }

    async fn broadcast(&self, envelope: Envelope) {
        let handles = self.registry.handles().await;
        tracing::debug!("Broadcasting to {} sessions", handles.len());
        for handle in handles {
            let result = match envelope.directive {
                Some(Directive::Prompt) => handle.write_prompt(envelope.payload.clone()),
                _ => handle.write_line(envelope.payload.clone()),
            };
            if let Err(err) = result {
                tracing::debug!("{}", err);
            }
        }
    }

    async fn control(&self, id: SessionId, envelope: Envelope) {
        let Some(handle) = self.resolve(id).await else {
            return;
        };

        let result = match envelope.directive {
            Some(Directive::Identify) => {
                let label = envelope.payload.trim();
                let identity = (!label.is_empty()).then(|| label.to_string());
                self.registry.set_identity(id, identity).await;
                return;
            }
            Some(Directive::Prompt) => {
                if !envelope.payload.is_empty() {
                    if let Err(err) = handle.write_prompt(envelope.payload) {
                        tracing::debug!("{}", err);
                    }
                }
                return;
            }
            Some(Directive::EchoOff) => handle.set_echo(false),
            Some(Directive::EchoOn) => handle.set_echo(true),
            None => Ok(()),
        };

        let result = result.and_then(|()| {
            if envelope.payload.is_empty() {
                Ok(())
            } else {
                handle.write_line(envelope.payload)
            }
        });
        if let Err(err) = result {
            tracing::debug!("{}", err);
        }
    }
}
