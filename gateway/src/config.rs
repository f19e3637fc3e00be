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

use crate::engine::EngineSettings;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_env_field::EnvField;
use std::collections::BTreeMap;
use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Arguments {
    #[arg(
        short = 'c',
        long = "config",
        help = "Path to configuration file",
        default_value = "gateway/config.yaml"
    )]
    pub config_file: String,

    #[arg(
        short = 'e',
        long = "env",
        help = "Path to environment file",
        default_value = "gateway/.env"
    )]
    pub env_file: Option<String>,
}

impl Default for Arguments {
    fn default() -> Self {
        Self {
            config_file: "config.yaml".to_string(),
            env_file: Some(".env".to_string()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Plain Telnet listener, on at its default address when omitted
    pub telnet: Option<TelnetConfig>,
    pub secure_telnet: Option<SecureTelnetConfig>,
    pub ssh: Option<SshConfig>,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub mssp: MsspConfig,
}

impl Configuration {
    pub fn load(path: &str) -> Result<Self, String> {
        tracing::debug!("Loading configuration from file: {}", path);
        let file =
            std::fs::File::open(path).map_err(|e| format!("Failed to open config file: {}", e))?;

        let conf = serde_yaml::from_reader(file)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;

        Ok(conf)
    }

    /// Engine channel settings, taking the shutdown grace from `session`
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            url: self.engine.url.as_str().to_string(),
            secret: self.engine.secret.as_str().to_string(),
            gateway_id: self.engine.gateway_id.clone(),
            reconnect_interval: Duration::from_millis(self.engine.reconnect_interval_ms),
            max_reconnect_interval: Duration::from_millis(
                self.engine
                    .max_reconnect_interval_ms
                    .max(self.engine.reconnect_interval_ms),
            ),
            connect_timeout: Duration::from_millis(self.engine.connect_timeout_ms),
            heartbeat_interval: Duration::from_secs(self.engine.heartbeat_interval.max(1)),
            queue_size: self.engine.queue_size.max(1),
            shutdown_grace: self.session.shutdown_grace(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub url: EnvField<EngineUrl>,

    /// Shared secret sent in the `hello` frame
    #[serde(default)]
    pub secret: EnvField<EngineSecret>,

    #[serde(default = "default_gateway_id")]
    pub gateway_id: String,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_max_reconnect_interval_ms")]
    pub max_reconnect_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Heartbeat interval in seconds (default: 10)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Envelopes held while the engine is away (default: 1000)
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_gateway_id() -> String {
    "mudlink-gateway".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    500
}

fn default_max_reconnect_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_queue_size() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            url: Default::default(),
            secret: Default::default(),
            gateway_id: default_gateway_id(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_interval_ms: default_max_reconnect_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval: default_heartbeat_interval(),
            queue_size: default_queue_size(),
        }
    }
}

/// WebSocket URL of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineUrl(String);

impl EngineUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for EngineUrl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("ws://") || s.starts_with("wss://") {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("engine url must start with ws:// or wss://, got '{}'", s))
        }
    }
}

impl Default for EngineUrl {
    fn default() -> Self {
        Self(String::from("ws://127.0.0.1:9000"))
    }
}

impl std::fmt::Display for EngineUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct EngineSecret(String);

impl EngineSecret {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for EngineSecret {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl std::fmt::Display for EngineSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} bytes>", self.0.len())
    }
}

impl std::fmt::Debug for EngineSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EngineSecret(<{} bytes>)", self.0.len())
    }
}

/// Listen address newtype with a default port
macro_rules! binding {
    ($name:ident, $port:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name(SocketAddr);

        impl $name {
            pub fn to_addr(&self) -> SocketAddr {
                self.0
            }
            pub fn to_ip(&self) -> IpAddr {
                self.0.ip()
            }
            pub fn to_port(&self) -> u16 {
                self.0.port()
            }
        }

        impl FromStr for $name {
            type Err = AddrParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(SocketAddr::from_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::new(0, 0, 0, 0),
                    $port,
                )))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

binding!(TelnetBinding, 4000);
binding!(SecureTelnetBinding, 4443);
binding!(SshBinding, 4022);

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TelnetConfig {
    #[serde(default)]
    pub addr: EnvField<TelnetBinding>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SecureTelnetConfig {
    #[serde(default)]
    pub addr: EnvField<SecureTelnetBinding>,

    /// PEM certificate chain
    pub cert_path: EnvField<PathBuf>,

    /// PEM private key
    pub key_path: EnvField<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub addr: EnvField<SshBinding>,

    /// OpenSSH or PEM private host key
    pub host_key_path: EnvField<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_negotiation_timeout_ms() -> u64 {
    500
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_max_line_length() -> usize {
    crate::protocol::codec::DEFAULT_MAX_LINE_LENGTH
}

impl SessionConfig {
    pub fn negotiation_window(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Bound for TLS handshakes and SSH shell requests
    pub fn login_timeout(&self) -> Duration {
        (self.negotiation_window() * 10).max(Duration::from_secs(5))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Values reported to MUD crawlers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsspConfig {
    #[serde(default = "default_mssp_name")]
    pub name: String,

    /// Extra fields such as `CODEBASE` or `CONTACT`, each with one or more values
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
}

fn default_mssp_name() -> String {
    "MudLink".to_string()
}

impl Default for MsspConfig {
    fn default() -> Self {
        MsspConfig {
            name: default_mssp_name(),
            fields: BTreeMap::new(),
        }
    }
}
