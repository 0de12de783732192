/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod kamakiri;
pub mod payload;

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info};
use tokio::time::sleep;

pub use crate::exploit::kamakiri::Kamakiri;
pub use crate::exploit::payload::Payload;
use crate::connection::port::{ConnectionType, detect, open_address};
use crate::connection::{Channel, ChannelConfig, Connection};
use crate::error::Result;
use crate::utilities::CancelToken;

/// Upper bound for the BootROM image sent back by the payload.
pub const MAX_ROM_DUMP: usize = 0x40000;

/// Remembers which device-family constant a hardware code accepted.
pub trait ConstantStore: Send {
    fn load(&self, hw_code: u16) -> Option<u8>;
    fn store(&mut self, hw_code: u16, constant: u8) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryConstantStore {
    constants: HashMap<u16, u8>,
}

impl MemoryConstantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConstantStore for MemoryConstantStore {
    fn load(&self, hw_code: u16) -> Option<u8> {
        self.constants.get(&hw_code).copied()
    }

    fn store(&mut self, hw_code: u16, constant: u8) -> Result<()> {
        self.constants.insert(hw_code, constant);
        Ok(())
    }
}

/// Brings a fresh BootROM link up after the device crashed or was re-seated.
///
/// The new link must use `config`, so that retry and timeout settings survive re-seats.
#[async_trait::async_trait]
pub trait DeviceConnector: Send {
    async fn reconnect(&mut self, cancel: &CancelToken, config: &ChannelConfig) -> Result<Connection>;
}

/// Waits for a BootROM port to show up and handshakes with it.
#[derive(Debug, Clone)]
pub struct PortConnector {
    pub poll_interval: Duration,
}

impl Default for PortConnector {
    fn default() -> Self {
        PortConnector { poll_interval: Duration::from_millis(250) }
    }
}

#[async_trait::async_trait]
impl DeviceConnector for PortConnector {
    async fn reconnect(&mut self, cancel: &CancelToken, config: &ChannelConfig) -> Result<Connection> {
        loop {
            cancel.check()?;

            let found = detect().await;
            if let Some(addr) = found.iter().find(|a| a.connection_type == ConnectionType::Brom) {
                debug!("BootROM port at {}", addr.location);
                let port = open_address(addr).await?;
                let channel = Channel::new(port).with_config(config.clone()).with_cancel(cancel.clone());
                let mut conn = Connection::from_channel(channel);
                conn.connect().await?;
                return Ok(conn);
            }

            sleep(self.poll_interval).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BruteForceEvent {
    Attempting { constant: u8 },
    WaitingForDevice { constant: u8 },
    AttemptFailed { constant: u8, reason: String },
    Found { constant: u8 },
}

#[derive(Debug, Clone)]
pub struct ExploitOptions {
    /// First constant tried when neither the store nor the chip profile knows one.
    pub start: u8,
    pub max_dump: usize,
}

impl Default for ExploitOptions {
    fn default() -> Self {
        ExploitOptions { start: 0, max_dump: MAX_ROM_DUMP }
    }
}

pub struct ExploitOutcome {
    pub constant: u8,
    pub rom: Vec<u8>,
}

impl std::fmt::Debug for ExploitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExploitOutcome")
            .field("constant", &format_args!("0x{:02X}", self.constant))
            .field("rom_len", &self.rom.len())
            .finish()
    }
}

/// Picks where the brute force starts for `hw_code`.
pub fn start_constant(
    store: &dyn ConstantStore,
    hw_code: u16,
    known: Option<u8>,
    options: &ExploitOptions,
) -> u8 {
    if let Some(c) = store.load(hw_code) {
        info!("Using stored constant 0x{:02X} for 0x{:04X}", c, hw_code);
        return c;
    }
    known.unwrap_or(options.start)
}
