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

use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use mudlink_gateway::config::{Arguments, Configuration};
use mudlink_gateway::server::{SecureTelnetServer, SshServer, TelnetServer};
use mudlink_gateway::ServerContext;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load arguments from the command line
    let arguments: Arguments = Parser::parse();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_ansi(true)
        .init();

    // Load environment variables from .env file if specified
    if let Some(ref env_file) = arguments.env_file {
        if std::path::Path::new(env_file).exists() {
            debug!("Loading environment variables from file: {}", env_file);
            dotenv::from_filename(env_file).ok();
        }
    } else {
        debug!("Loading environment variables from default file");
        dotenv::dotenv().ok();
    }

    // Load configuration from a file with environment variable substitution
    let config = Configuration::load(&arguments.config_file)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Unable to load configuration from {}", arguments.config_file))?;

    debug!("Configuration loaded: {:?}", config);
    info!("Starting MudLink Gateway...");

    let shutdown = CancellationToken::new();
    let grace = config.session.shutdown_grace();
    let (context, inbound) = ServerContext::new(
        config.engine_settings(),
        config.session.clone(),
        &config.mssp,
        shutdown.clone(),
    );

    // Bind every listener before anything starts; a bind failure is fatal
    let telnet_config = config.telnet.unwrap_or_default();
    let telnet = TelnetServer::bind(telnet_config.addr.to_addr())
        .await
        .context("Unable to start Telnet listener")?;
    info!(
        "Telnet Server listening on {} ({}:{})",
        telnet_config.addr,
        telnet_config.addr.to_ip(),
        telnet_config.addr.to_port(),
    );

    let secure_telnet = match &config.secure_telnet {
        Some(tls) => {
            let server = SecureTelnetServer::bind(tls.addr.to_addr(), &tls.cert_path, &tls.key_path)
                .await
                .context("Unable to start Secure Telnet listener")?;
            info!("Secure Telnet Server listening on {}", *tls.addr);
            Some(server)
        }
        None => None,
    };

    let ssh = match &config.ssh {
        Some(ssh) => {
            let server = SshServer::bind(ssh.addr.to_addr(), &ssh.host_key_path)
                .await
                .context("Unable to start SSH listener")?;
            info!("SSH Server listening on {}", *ssh.addr);
            Some(server)
        }
        None => None,
    };

    // Engine channel and inbound dispatch
    let mut tasks = JoinSet::new();
    let bridge = context.bridge().clone();
    tasks.spawn(async move { bridge.run().await });
    let router = context.router().clone();
    tasks.spawn(async move { router.run(inbound).await });

    // Listeners
    tasks.spawn(telnet.run(context.clone()));
    if let Some(server) = secure_telnet {
        tasks.spawn(server.run(context.clone()));
    }
    if let Some(server) = ssh {
        tasks.spawn(server.run(context.clone()));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Unable to listen for shutdown signal")?;
    info!("Shutdown requested, closing {} sessions", context.registry().count().await);
    shutdown.cancel();

    // Sessions and the engine queue get the grace period, plus a little
    // for the bridge to send its close frame
    let deadline = grace + Duration::from_millis(500);
    if tokio::time::timeout(deadline, async { while tasks.join_next().await.is_some() {} })
        .await
        .is_err()
    {
        tracing::warn!("Tasks still running after {:?}, exiting anyway", deadline);
        tasks.abort_all();
    }

    info!("MudLink Gateway stopped");
    Ok(())
}
