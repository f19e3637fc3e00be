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

use super::SessionRoster;
use futures::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge};
use mudlink_common::{Envelope, EnvelopeError, EnvelopeKind, SystemEvent};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

type EngineSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Engine channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected, waiting to retry
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and draining
    Connected,
}

impl ChannelState {
    fn gauge_value(self) -> f64 {
        match self {
            ChannelState::Disconnected => 0.0,
            ChannelState::Connecting => 1.0,
            ChannelState::Connected => 2.0,
        }
    }
}

/// Pending queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of envelopes currently queued
    pub queued_count: usize,

    /// Number of envelopes sent since the last connect
    pub processed_count: usize,

    /// Number of envelopes dropped due to queue overflow
    pub dropped_count: usize,

    /// Maximum queue size
    pub max_queue_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unable to connect to engine: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("engine websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("unable to encode envelope: {0}")]
    Encode(#[from] EnvelopeError),
}

/// Engine channel tunables
#[derive(Clone)]
pub struct EngineSettings {
    /// `ws://` URL of the engine
    pub url: String,
    /// Shared secret presented in `hello`
    pub secret: String,
    /// Name this gateway reports in `hello`
    pub gateway_id: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub queue_size: usize,
    /// Time allowed to flush the queue on shutdown
    pub shutdown_grace: Duration,
}

impl std::fmt::Debug for EngineSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSettings")
            .field("url", &self.url)
            .field("secret", &format_args!("<{} bytes>", self.secret.len()))
            .field("gateway_id", &self.gateway_id)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("max_reconnect_interval", &self.max_reconnect_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("queue_size", &self.queue_size)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000".to_string(),
            secret: String::new(),
            gateway_id: "mudlink-gateway".to_string(),
            reconnect_interval: Duration::from_millis(500),
            max_reconnect_interval: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(5_000),
            heartbeat_interval: Duration::from_secs(10),
            queue_size: 1000,
            shutdown_grace: Duration::from_millis(2_000),
        }
    }
}

/// How a connection ended
enum Exit {
    Lost,
    Shutdown,
}

/// The single engine channel
///
/// Envelopes handed to [`EngineBridge::send`] are always queued; the task
/// running [`EngineBridge::run`] owns the socket and drains the queue in
/// order whenever it is connected.
pub struct EngineBridge {
    settings: EngineSettings,
    roster: Arc<dyn SessionRoster>,
    shutdown: CancellationToken,
    state: watch::Sender<ChannelState>,
    queue: Mutex<VecDeque<Envelope>>,
    pending: Notify,
    processed: AtomicUsize,
    dropped: AtomicUsize,
    inbound: mpsc::UnboundedSender<Envelope>,
}

impl EngineBridge {
    /// Create the bridge and the receiver for envelopes from the engine
    pub fn new(
        settings: EngineSettings,
        roster: Arc<dyn SessionRoster>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let bridge = Arc::new(Self {
            settings,
            roster,
            shutdown,
            state,
            queue: Mutex::new(VecDeque::new()),
            pending: Notify::new(),
            processed: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            inbound,
        });
        (bridge, inbound_rx)
    }

    /// Current connection state
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            gauge!("gateway_engine_connection_state").set(state.gauge_value());
            event!(Level::DEBUG, ?state, "Engine channel state changed");
        }
    }

    pub async fn queue_stats(&self) -> QueueStats {
        let queue = self.queue.lock().await;
        QueueStats {
            queued_count: queue.len(),
            processed_count: self.processed.load(Ordering::Relaxed),
            dropped_count: self.dropped.load(Ordering::Relaxed),
            max_queue_size: self.settings.queue_size,
        }
    }

    /// Queue an envelope for the engine
    ///
    /// Never fails. When the queue is full the oldest envelope is dropped.
    pub async fn send(&self, envelope: Envelope) {
        let mut queue = self.queue.lock().await;

        if queue.len() >= self.settings.queue_size.max(1) {
            if let Some(oldest) = queue.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_engine_queue_dropped_total").increment(1);
                tracing::warn!(
                    session_id = ?oldest.session_id,
                    kind = ?oldest.kind,
                    "Engine queue full ({}), dropped oldest envelope",
                    self.settings.queue_size
                );
            }
        }

        queue.push_back(envelope);
        gauge!("gateway_engine_queue_size").set(queue.len() as f64);
        drop(queue);

        self.pending.notify_one();
    }

    /// Connect, serve and reconnect until shutdown
    pub async fn run(&self) {
        let mut backoff = self.settings.reconnect_interval;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(ChannelState::Connecting);
            tracing::info!("Connecting to engine at {}", self.settings.url);

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(socket) => {
                    backoff = self.settings.reconnect_interval;
                    self.processed.store(0, Ordering::Relaxed);
                    self.set_state(ChannelState::Connected);
                    counter!("gateway_engine_connects_total").increment(1);
                    tracing::info!("Engine connection established to {}", self.settings.url);

                    let outcome = self.serve(socket).await;
                    self.set_state(ChannelState::Disconnected);
                    match outcome {
                        Ok(Exit::Shutdown) => break,
                        Ok(Exit::Lost) => tracing::warn!("Engine closed the connection"),
                        Err(err) => tracing::warn!("Engine connection lost: {}", err),
                    }
                }
                Err(err) => {
                    self.set_state(ChannelState::Disconnected);
                    tracing::warn!("{}", err);
                }
            }

            let delay = with_jitter(backoff);
            tracing::debug!("Reconnecting to engine in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = next_backoff(backoff, self.settings.max_reconnect_interval);
        }

        self.set_state(ChannelState::Disconnected);
        tracing::info!("Engine channel stopped");
    }

    async fn connect(&self) -> Result<EngineSocket, BridgeError> {
        let (socket, _response) = timeout(
            self.settings.connect_timeout,
            connect_async(self.settings.url.as_str()),
        )
        .await
        .map_err(|_| BridgeError::Timeout(self.settings.connect_timeout))?
        .map_err(BridgeError::Connect)?;
        Ok(socket)
    }

    async fn serve(&self, socket: EngineSocket) -> Result<Exit, BridgeError> {
        let (mut sink, mut stream) = socket.split();

        let hello = Envelope::system(&SystemEvent::Hello {
            secret: self.settings.secret.clone(),
            gateway_id: self.settings.gateway_id.clone(),
        })?;
        transmit(&mut sink, &hello).await?;

        let sessions = self.roster.announcements().await;
        tracing::info!("Announcing {} live sessions to engine", sessions.len());
        transmit(&mut sink, &Envelope::system(&SystemEvent::Resync { sessions })?).await?;

        self.drain(&mut sink).await?;

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.drain_for_shutdown(&mut sink).await;
                    if let Err(err) = sink.send(Message::Close(None)).await {
                        tracing::debug!("Engine close failed: {}", err);
                    }
                    return Ok(Exit::Shutdown);
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.receive(text.as_str()),
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!("Ignoring binary frame from engine");
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(Exit::Lost),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
                _ = self.pending.notified() => {
                    self.drain(&mut sink).await?;
                }
                _ = heartbeat.tick() => {
                    let sessions = self.roster.count().await;
                    transmit(&mut sink, &Envelope::system(&SystemEvent::Heartbeat { sessions })?).await?;
                }
            }
        }
    }

    /// Send queued envelopes in order until the queue is empty
    ///
    /// An envelope that fails to send is put back at the front.
    async fn drain<S>(&self, sink: &mut S) -> Result<usize, BridgeError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let mut sent = 0;
        loop {
            let Some(envelope) = self.queue.lock().await.pop_front() else {
                break;
            };

            if envelope.kind == EnvelopeKind::InputLine {
                if let Some(id) = envelope.session_id {
                    if !self.roster.is_registered(id).await {
                        tracing::debug!(session_id = %id, "Discarding queued input for closed session");
                        continue;
                    }
                }
            }

            if let Err(err) = transmit(sink, &envelope).await {
                if matches!(err, BridgeError::Encode(_)) {
                    tracing::error!("Dropping envelope that cannot be encoded: {}", err);
                    continue;
                }
                let mut queue = self.queue.lock().await;
                queue.push_front(envelope);
                gauge!("gateway_engine_queue_size").set(queue.len() as f64);
                return Err(err);
            }
            sent += 1;
            self.processed.fetch_add(1, Ordering::Relaxed);
        }

        gauge!("gateway_engine_queue_size").set(0.0);
        if sent > 0 {
            tracing::debug!("Sent {} queued envelopes to engine", sent);
        }
        Ok(sent)
    }

    /// Keep draining until sessions are gone and the queue is empty, or the
    /// grace period runs out
    async fn drain_for_shutdown<S>(&self, sink: &mut S)
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let deadline = Instant::now() + self.settings.shutdown_grace;
        loop {
            if let Err(err) = self.drain(sink).await {
                tracing::warn!("Unable to flush engine queue during shutdown: {}", err);
                return;
            }
            if self.roster.count().await == 0 && self.queue.lock().await.is_empty() {
                return;
            }
            if timeout_at(deadline, self.pending.notified()).await.is_err() {
                let remaining = self.queue.lock().await.len();
                if remaining > 0 {
                    tracing::warn!("Shutdown grace elapsed with {} envelopes unsent", remaining);
                }
                return;
            }
        }
    }

    fn receive(&self, text: &str) {
        counter!("gateway_engine_frames_received_total").increment(1);
        match Envelope::from_json(text) {
            Ok(envelope) => {
                if self.inbound.send(envelope).is_err() {
                    tracing::debug!("Router stopped, dropping engine envelope");
                }
            }
            Err(err) => {
                counter!("gateway_engine_malformed_total").increment(1);
                tracing::warn!("Dropping malformed engine envelope: {}", err);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn queued(&self) -> Vec<Envelope> {
        self.queue.lock().await.iter().cloned().collect()
    }
}

async fn transmit<S>(sink: &mut S, envelope: &Envelope) -> Result<(), BridgeError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = envelope.to_json()?;
    sink.send(Message::Text(text.into())).await?;
    counter!("gateway_engine_frames_sent_total").increment(1);
    Ok(())
}

/// Double the delay, capped
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Add up to 25% random jitter
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}
