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

//! Shared harness: a fake engine and an in-process gateway

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use mudlink_common::{Envelope, SessionAnnouncement, SystemEvent};
use mudlink_gateway::config::{MsspConfig, SessionConfig};
use mudlink_gateway::server::{SecureTelnetServer, SshServer, TelnetServer};
use mudlink_gateway::{EngineSettings, ServerContext};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// Bytes the gateway sends on every new Telnet connection
pub const OPENING: [u8; 15] = [
    255, 251, 3, // WILL SGA
    255, 252, 1, // WONT ECHO
    255, 251, 70, // WILL MSSP
    255, 253, 31, // DO NAWS
    255, 253, 34, // DO LINEMODE
];

/// WebSocket server standing in for the game engine
pub struct FakeEngine {
    listener: TcpListener,
    pub url: String,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    /// Accept the gateway's next connection
    pub async fn accept(&self) -> EngineConnection {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("gateway did not connect")
            .unwrap();
        let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        EngineConnection { socket }
    }
}

pub struct EngineConnection {
    socket: WebSocketStream<TcpStream>,
}

impl EngineConnection {
    pub async fn recv(&mut self) -> Envelope {
        loop {
            let message = timeout(WAIT, self.socket.next())
                .await
                .expect("no envelope from gateway")
                .expect("gateway closed the engine connection")
                .unwrap();
            if let Message::Text(text) = message {
                return Envelope::from_json(text.as_str()).unwrap();
            }
        }
    }

    /// Next envelope if one arrives within `wait`
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Envelope> {
        match timeout(wait, self.recv()).await {
            Ok(envelope) => Some(envelope),
            Err(_) => None,
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        self.socket
            .send(Message::Text(envelope.to_json().unwrap().into()))
            .await
            .unwrap();
    }

    /// Consume `hello` and `resync`, returning the resynced sessions
    pub async fn expect_handshake(&mut self) -> Vec<SessionAnnouncement> {
        match self.recv().await.system_event().unwrap() {
            SystemEvent::Hello { secret, .. } => assert_eq!(secret, "test-secret"),
            other => panic!("Expected hello, got {:?}", other),
        }
        match self.recv().await.system_event().unwrap() {
            SystemEvent::Resync { sessions } => sessions,
            other => panic!("Expected resync, got {:?}", other),
        }
    }
}

/// In-process gateway wired to a fake engine
pub struct Gateway {
    pub context: ServerContext,
    pub telnet_addr: SocketAddr,
    pub tls_addr: Option<SocketAddr>,
    pub ssh_addr: Option<SocketAddr>,
}

impl Gateway {
    pub async fn start(engine_url: &str) -> Self {
        Self::start_with_tls(engine_url, None).await
    }

    pub async fn start_with_tls(engine_url: &str, tls: Option<(&Path, &Path)>) -> Self {
        Self::launch(engine_url, tls, None).await
    }

    pub async fn start_with_ssh(engine_url: &str, host_key: &Path) -> Self {
        Self::launch(engine_url, None, Some(host_key)).await
    }

    async fn launch(engine_url: &str, tls: Option<(&Path, &Path)>, ssh: Option<&Path>) -> Self {
        let settings = EngineSettings {
            url: engine_url.to_string(),
            secret: "test-secret".to_string(),
            reconnect_interval: Duration::from_millis(50),
            max_reconnect_interval: Duration::from_millis(200),
            connect_timeout: WAIT,
            heartbeat_interval: Duration::from_secs(60),
            queue_size: 100,
            shutdown_grace: Duration::from_millis(500),
            ..Default::default()
        };
        let session = SessionConfig {
            negotiation_timeout_ms: 200,
            shutdown_grace_ms: 500,
            ..Default::default()
        };
        let mssp = MsspConfig {
            name: "Test MUD".to_string(),
            fields: BTreeMap::from([("CODEBASE".to_string(), vec!["MudLink".to_string()])]),
        };

        let (context, inbound) =
            ServerContext::new(settings, session, &mssp, CancellationToken::new());

        let bridge = context.bridge().clone();
        tokio::spawn(async move { bridge.run().await });
        let router = context.router().clone();
        tokio::spawn(async move { router.run(inbound).await });

        let telnet = TelnetServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let telnet_addr = telnet.local_addr().unwrap();
        tokio::spawn(telnet.run(context.clone()));

        let tls_addr = match tls {
            Some((cert, key)) => {
                let server = SecureTelnetServer::bind("127.0.0.1:0".parse().unwrap(), cert, key)
                    .await
                    .unwrap();
                let addr = server.local_addr().unwrap();
                tokio::spawn(server.run(context.clone()));
                Some(addr)
            }
            None => None,
        };

        let ssh_addr = match ssh {
            Some(host_key) => {
                let server = SshServer::bind("127.0.0.1:0".parse().unwrap(), host_key)
                    .await
                    .unwrap();
                let addr = server.local_addr().unwrap();
                tokio::spawn(server.run(context.clone()));
                Some(addr)
            }
            None => None,
        };

        Self {
            context,
            telnet_addr,
            tls_addr,
            ssh_addr,
        }
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        for _ in 0..500 {
            if self.context.registry().count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Expected {} sessions", count);
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.context.shutdown().cancel();
    }
}

/// Read from a client until `needle` shows up, returning everything read
pub async fn read_until<S>(stream: &mut S, needle: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut received = Vec::new();
    let mut buffer = [0u8; 1024];
    while !contains(&received, needle) {
        let read = timeout(WAIT, stream.read(&mut buffer))
            .await
            .expect("timed out waiting for client bytes")
            .unwrap();
        assert!(read > 0, "connection closed before {:?} arrived", needle);
        received.extend_from_slice(&buffer[..read]);
    }
    received
}

/// Read until the gateway closes the connection
pub async fn read_to_close<S>(stream: &mut S) -> Vec<u8>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut received = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut received))
        .await
        .expect("gateway did not close the connection")
        .unwrap();
    received
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
