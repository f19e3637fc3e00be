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

//! Telnet over TLS listener

use super::telnet::serve_telnet;
use super::{ListenerError, bind, handshake_failed, next_connection};
use crate::context::ServerContext;
use mudlink_common::TransportKind;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub struct SecureTelnetServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl SecureTelnetServer {
    /// Load the certificate and key, then bind
    pub async fn bind(
        addr: SocketAddr,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, ListenerError> {
        let acceptor = load_acceptor(cert_path, key_path)?;
        Ok(Self {
            listener: bind(addr).await?,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown
    pub async fn run(self, context: ServerContext) {
        let handshake_timeout = context.session().login_timeout();
        while let Some((stream, peer)) =
            next_connection(&self.listener, context.shutdown(), "secure-telnet").await
        {
            let acceptor = self.acceptor.clone();
            let context = context.clone();
            tokio::spawn(async move {
                let tls = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(err)) => return handshake_failed("secure-telnet", peer, err),
                    Err(_) => return handshake_failed("secure-telnet", peer, "TLS handshake timed out"),
                };
                serve_telnet(tls, peer, TransportKind::SecureTelnet, context).await;
            });
        }
        tracing::info!("Secure Telnet listener stopped");
    }
}

/// Build a TLS acceptor from PEM files
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ListenerError> {
    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| ListenerError::Tls(format!("{}: {}", path.display(), e)))
    };

    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ListenerError::Tls(format!("{}: {}", cert_path.display(), e)))?;
    if certs.is_empty() {
        return Err(ListenerError::Tls(format!(
            "{}: no certificates found",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| ListenerError::Tls(format!("{}: {}", key_path.display(), e)))?
        .ok_or_else(|| {
            ListenerError::Tls(format!("{}: no private key found", key_path.display()))
        })?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ListenerError::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| ListenerError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
