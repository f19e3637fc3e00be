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

//! Client listeners
//!
//! Each listener binds at construction so that a bad address fails startup,
//! then accepts until shutdown, handing every connection to its own task.

use metrics::counter;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub mod ssh;
pub mod telnet;
pub mod tls;

pub use self::ssh::SshServer;
pub use self::telnet::TelnetServer;
pub use self::tls::SecureTelnetServer;

/// Pause after a failed accept, so descriptor exhaustion does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("SSH host key error: {0}")]
    HostKey(String),
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ListenerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind { addr, source })
}

/// Next accepted connection, or `None` once shutdown is signalled
async fn next_connection(
    listener: &TcpListener,
    shutdown: &CancellationToken,
    kind: &'static str,
) -> Option<(TcpStream, SocketAddr)> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    counter!("gateway_connections_accepted_total", "listener" => kind).increment(1);
                    tracing::debug!(%peer, "Accepted {} connection", kind);
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, "Unable to set TCP_NODELAY: {}", err);
                    }
                    return Some((stream, peer));
                }
                Err(err) => {
                    tracing::warn!("{} accept failed: {}", kind, err);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

fn handshake_failed(kind: &'static str, peer: SocketAddr, reason: impl std::fmt::Display) {
    counter!("gateway_handshake_failures_total", "listener" => kind).increment(1);
    tracing::debug!(%peer, "{} handshake failed: {}", kind, reason);
}
