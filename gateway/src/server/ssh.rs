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

//! SSH listener

use super::{ListenerError, bind, handshake_failed, next_connection};
use crate::context::ServerContext;
use crate::protocol::ssh::{SshHandler, SshStream};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

pub struct SshServer {
    listener: TcpListener,
    config: Arc<russh::server::Config>,
}

impl SshServer {
    /// Load the host key, then bind
    pub async fn bind(addr: SocketAddr, host_key_path: &Path) -> Result<Self, ListenerError> {
        let key = russh_keys::load_secret_key(host_key_path, None)
            .map_err(|e| ListenerError::HostKey(format!("{}: {}", host_key_path.display(), e)))?;

        let config = russh::server::Config {
            keys: vec![key],
            auth_rejection_time: Duration::from_millis(250),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };

        Ok(Self {
            listener: bind(addr).await?,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown
    pub async fn run(self, context: ServerContext) {
        while let Some((stream, peer)) =
            next_connection(&self.listener, context.shutdown(), "ssh").await
        {
            let config = self.config.clone();
            let context = context.clone();
            tokio::spawn(async move {
                serve_ssh(stream, peer, config, context).await;
            });
        }
        tracing::info!("SSH listener stopped");
    }
}

/// Run the SSH protocol and start a session once a shell is requested
async fn serve_ssh(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<russh::server::Config>,
    context: ServerContext,
) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (lines_tx, lines_rx) = mpsc::unbounded_channel();
    let echo = Arc::new(AtomicBool::new(true));
    let handler = SshHandler::new(
        peer,
        ready_tx,
        lines_tx,
        echo.clone(),
        context.session().max_line_length,
    );

    let driver = tokio::spawn(async move {
        russh::server::run_stream(config, stream, handler).await?.await
    });

    let channel = tokio::select! {
        ready = ready_rx => match ready {
            Ok(channel) => channel,
            Err(_) => {
                let reason = match driver.await {
                    Ok(Err(err)) => err.to_string(),
                    _ => "connection closed before shell request".to_string(),
                };
                return handshake_failed("ssh", peer, reason);
            }
        },
        _ = tokio::time::sleep(context.session().login_timeout()) => {
            driver.abort();
            return handshake_failed("ssh", peer, "no shell requested in time");
        }
    };

    let stream = SshStream::new(channel, lines_rx, echo, driver);
    context.router().serve(Box::new(stream), peer).await;
}
