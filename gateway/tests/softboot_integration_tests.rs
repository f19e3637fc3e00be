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

mod common;

use common::{FakeEngine, Gateway, OPENING, WAIT, read_until};
use mudlink_common::{Directive, Envelope, EnvelopeKind, SystemEvent};
use mudlink_gateway::ChannelState;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn test_softboot_preserves_sessions_and_input() {
    let engine = FakeEngine::start().await;
    let gateway = Gateway::start(&engine.url).await;
    let mut first = engine.accept().await;
    first.expect_handshake().await;

    let mut client = TcpStream::connect(gateway.telnet_addr).await.unwrap();
    let mut opening = [0u8; 15];
    timeout(WAIT, client.read_exact(&mut opening))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(opening, OPENING);

    client.write_all(b"look\r\n").await.unwrap();
    let id = first.recv().await.session_id.unwrap();
    assert_eq!(first.recv().await, Envelope::input_line(id, "look"));

    first
        .send(
            &Envelope::new(Some(id), EnvelopeKind::System, "Aragorn")
                .with_directive(Directive::Identify),
        )
        .await;
    for _ in 0..500 {
        let session = gateway.context.registry().get(id).await.unwrap();
        if session.identity.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Engine goes away
    let mut state = gateway.context.bridge().subscribe();
    drop(first);
    timeout(WAIT, state.wait_for(|state| *state != ChannelState::Connected))
        .await
        .unwrap()
        .unwrap();

    client.write_all(b"north\r\n").await.unwrap();
    client.write_all(b"say anyone?\r\n").await.unwrap();
    for _ in 0..500 {
        if gateway.context.bridge().queue_stats().await.queued_count == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gateway.context.bridge().queue_stats().await.queued_count, 2);
    assert_eq!(gateway.context.registry().count().await, 1);

    // Engine comes back
    let mut second = engine.accept().await;
    let sessions = second.expect_handshake().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, id);
    assert_eq!(sessions[0].identity.as_deref(), Some("Aragorn"));

    assert_eq!(second.recv().await, Envelope::input_line(id, "north"));
    assert_eq!(second.recv().await, Envelope::input_line(id, "say anyone?"));

    second.send(&Envelope::output_line(id, "You are back.")).await;
    read_until(&mut client, b"You are back.\r\n").await;
}

#[tokio::test]
async fn test_session_closed_during_outage_is_reported() {
    let engine = FakeEngine::start().await;
    let gateway = Gateway::start(&engine.url).await;
    let mut first = engine.accept().await;
    first.expect_handshake().await;

    let mut client = TcpStream::connect(gateway.telnet_addr).await.unwrap();
    client.write_all(b"hello\r\n").await.unwrap();
    let id = first.recv().await.session_id.unwrap();
    first.recv().await;

    let mut state = gateway.context.bridge().subscribe();
    drop(first);
    timeout(WAIT, state.wait_for(|state| *state != ChannelState::Connected))
        .await
        .unwrap()
        .unwrap();

    client.write_all(b"goodbye\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(client);
    gateway.wait_for_sessions(0).await;

    let mut second = engine.accept().await;
    assert!(second.expect_handshake().await.is_empty());
    assert_eq!(second.recv().await, Envelope::session_closed(id));
}

#[tokio::test]
async fn test_engine_system_events_keep_channel_up() {
    let engine = FakeEngine::start().await;
    let gateway = Gateway::start(&engine.url).await;
    let mut conn = engine.accept().await;
    conn.expect_handshake().await;

    conn.send(
        &Envelope::system(&SystemEvent::Heartbeat { sessions: 0 }).unwrap(),
    )
    .await;
    conn.send(&Envelope::new(None, EnvelopeKind::System, "not an event"))
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.context.bridge().is_connected());
}
