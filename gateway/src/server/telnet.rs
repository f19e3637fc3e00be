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

//! Plain Telnet listener

use super::{ListenerError, bind, handshake_failed, next_connection};
use crate::context::ServerContext;
use crate::protocol::LineStream;
use crate::protocol::telnet::{Handshake, TelnetStream};
use metrics::counter;
use mudlink_common::TransportKind;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

pub struct TelnetServer {
    listener: TcpListener,
}

impl TelnetServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ListenerError> {
        Ok(Self {
            listener: bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown
    pub async fn run(self, context: ServerContext) {
        while let Some((stream, peer)) =
            next_connection(&self.listener, context.shutdown(), "telnet").await
        {
            let context = context.clone();
            tokio::spawn(async move {
                serve_telnet(stream, peer, TransportKind::Telnet, context).await;
            });
        }
        tracing::info!("Telnet listener stopped");
    }
}

/// Negotiate and then run a Telnet session over any byte stream
pub(crate) async fn serve_telnet<S>(
    io: S,
    peer: SocketAddr,
    transport: TransportKind,
    context: ServerContext,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut stream = TelnetStream::new(
        io,
        transport,
        context.mssp().clone(),
        context.session().max_line_length,
    );

    match stream.negotiate(context.session().negotiation_window()).await {
        Ok(Handshake::Session) => context.router().serve(Box::new(stream), peer).await,
        Ok(Handshake::MsspProbe) => {
            counter!("gateway_mssp_probes_total").increment(1);
            tracing::info!(%peer, %transport, "Answered MSSP probe");
            if let Err(err) = stream.close().await {
                tracing::debug!(%peer, "MSSP probe close failed: {}", err);
            }
        }
        Err(err) => {
            let kind = match transport {
                TransportKind::SecureTelnet => "secure-telnet",
                _ => "telnet",
            };
            handshake_failed(kind, peer, err);
        }
    }
}
