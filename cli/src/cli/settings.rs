/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use umbra::connection::ChannelConfig;
use umbra::core::crypto::PollConfig;
use umbra::exploit::{ExploitOptions, MAX_ROM_DUMP, PortConnector};

pub const ENV_PREFIX: &str = "UMBRA";
pub const STATE_FILE: &str = ".umbra_state";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LinkSettings {
    pub chunk_size: usize,
    pub write_attempts: u32,
    pub read_attempts: u32,
    pub read_timeout_ms: u64,
    /// Switch serial links to the escalated rate after the handshake.
    pub escalate_baud: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let defaults = ChannelConfig::default();
        LinkSettings {
            chunk_size: defaults.chunk_size,
            write_attempts: defaults.write_attempts,
            read_attempts: defaults.read_attempts,
            read_timeout_ms: defaults.read_timeout.as_millis() as u64,
            escalate_baud: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CryptoSettings {
    pub poll_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        let defaults = PollConfig::default();
        CryptoSettings {
            poll_timeout_ms: defaults.timeout.as_millis() as u64,
            poll_interval_ms: defaults.interval.as_millis() as u64,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ExploitSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<PathBuf>,
    pub start: u8,
    pub max_dump: usize,
    pub reconnect_interval_ms: u64,
}

impl Default for ExploitSettings {
    fn default() -> Self {
        ExploitSettings {
            payload: None,
            start: 0,
            max_dump: MAX_ROM_DUMP,
            reconnect_interval_ms: PortConnector::default().poll_interval.as_millis() as u64,
        }
    }
}

/// Layered as defaults, then `config.toml`, then `UMBRA_*` variables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub state_file: PathBuf,
    pub link: LinkSettings,
    pub crypto: CryptoSettings,
    pub exploit: ExploitSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            state_file: PathBuf::from(STATE_FILE),
            link: LinkSettings::default(),
            crypto: CryptoSettings::default(),
            exploit: ExploitSettings::default(),
        }
    }
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("umbra").join("config.toml"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).prefix_separator("_").separator("__").try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            chunk_size: self.link.chunk_size,
            write_attempts: self.link.write_attempts,
            read_attempts: self.link.read_attempts,
            read_timeout: Duration::from_millis(self.link.read_timeout_ms),
        }
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            timeout: Duration::from_millis(self.crypto.poll_timeout_ms),
            interval: Duration::from_millis(self.crypto.poll_interval_ms),
        }
    }

    pub fn exploit_options(&self, start: Option<u8>) -> ExploitOptions {
        ExploitOptions { start: start.unwrap_or(self.exploit.start), max_dump: self.exploit.max_dump }
    }

    pub fn connector(&self) -> PortConnector {
        PortConnector { poll_interval: Duration::from_millis(self.exploit.reconnect_interval_ms) }
    }
}
