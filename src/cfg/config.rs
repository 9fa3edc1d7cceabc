// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::SocketAddr, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::ws::{cipher::Encryption, extension::CompressMethod};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Event reactor tunables.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Protocol parameters shared by server and client sessions.
    #[serde(default)]
    pub websocket: WebsocketConfig,
    /// Listener-side settings; ignored by pure clients.
    #[serde(default)]
    pub server: ServerConfig,
    /// Connector-side settings; ignored by pure servers.
    #[serde(default)]
    pub client: ClientConfig,
}

/// Event reactor tunables.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(rename = "MaxSockets", default = "default_max_sockets")]
    /// Cap on simultaneously tracked descriptors.
    pub max_sockets: u32,

    #[serde(rename = "Frequency", default = "default_frequency")]
    /// Selector timeout in milliseconds while interests exist.
    pub frequency: u32,

    #[serde(rename = "Easily", default)]
    /// Cooperative mode: yield for `Frequency` ms every iteration.
    pub easily: bool,
}

/// Protocol parameters applied to every session.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WebsocketConfig {
    #[serde(rename = "PingInterval", default = "default_ping_interval")]
    /// Seconds between PINGs; supervision runs at half this period.
    pub ping_interval: u16,

    #[serde(rename = "WaitPong", default = "default_wait_pong")]
    /// Seconds of PONG silence tolerated before the session is dropped.
    pub wait_pong: u16,

    #[serde(rename = "SegmentSize", default = "default_segment_size")]
    /// Fragmentation threshold for outbound messages, in bytes.
    pub segment_size: usize,

    #[serde(rename = "MaxRequests", default = "default_max_requests")]
    /// Keep-alive HTTP request cap ahead of the upgrade.
    pub max_requests: u32,

    #[serde(rename = "Compressors", default)]
    /// Negotiable compression methods, in preference order.
    pub compressors: Vec<CompressMethod>,

    #[serde(rename = "Subprotocols", default)]
    /// Subprotocols this endpoint is willing to speak.
    pub subprotocols: Vec<String>,

    #[serde(rename = "Encryption", default)]
    /// Optional payload encryption parameters.
    pub encryption: Encryption,
}

/// Listener-side settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(rename = "Host", default = "default_host")]
    pub host: String,

    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,

    #[serde(rename = "Total", default = "default_total")]
    /// Simultaneous connection cap; extras are refused with 503.
    pub total: u32,
}

/// Connector-side settings.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ClientConfig {
    #[serde(rename = "Host", default)]
    /// Value of the `Host` header in the upgrade request.
    pub host: String,

    #[serde(rename = "Path", default)]
    /// Request target of the upgrade request.
    pub path: String,

    #[serde(rename = "Authorization", default)]
    /// Verbatim `Authorization` header value, if any.
    pub authorization: Option<String>,
}

fn default_max_sockets() -> u32 {
    crate::reactor::base::DEFAULT_MAX_COUNT
}

fn default_frequency() -> u32 {
    100
}

fn default_ping_interval() -> u16 {
    5
}

fn default_wait_pong() -> u16 {
    10
}

fn default_segment_size() -> usize {
    16 * 1024
}

fn default_max_requests() -> u32 {
    100
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_total() -> u32 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sockets: default_max_sockets(),
            frequency: default_frequency(),
            easily: false,
        }
    }
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: default_ping_interval(),
            wait_pong: default_wait_pong(),
            segment_size: default_segment_size(),
            max_requests: default_max_requests(),
            compressors: Vec::new(),
            subprotocols: Vec::new(),
            encryption: Encryption::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            total: default_total(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("bad listen address {}:{}", self.host, self.port))
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(&path).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        let cfg: Config = serde_yaml::from_str(&raw).with_context(|| {
            format!("Failed to parse config file: {}", path.as_ref().display())
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.engine.max_sockets > 0, "MaxSockets must be positive");
        ensure!(
            self.websocket.segment_size > 0,
            "SegmentSize must be positive"
        );
        ensure!(
            self.websocket.ping_interval == 0
                || self.websocket.wait_pong >= self.websocket.ping_interval,
            "WaitPong must be at least PingInterval"
        );
        ensure!(self.server.total > 0, "Total must be positive");
        Ok(())
    }
}
