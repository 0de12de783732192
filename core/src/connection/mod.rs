/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod backend;
pub mod channel;
pub mod command;
pub mod port;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::sleep;

pub use crate::connection::channel::{Channel, ChannelConfig};
use crate::connection::command::{
    ACK,
    BAUD_CHANGE_ARGS,
    BAUD_SYNC,
    Command,
    ESCALATED_BAUDRATE,
    HANDSHAKE_SEQ,
    HANDSHAKE_START,
};
use crate::connection::port::{ConnectionType, MTKPort};
use crate::error::{Error, ProtocolError, Result};

/// Start bytes sent before giving up on a handshake.
const HANDSHAKE_ATTEMPTS: usize = 200;
const SETTLE_ROUNDS: usize = 10;
const SETTLE_DELAY: Duration = Duration::from_millis(20);
const BAUD_SWITCH_DELAY: Duration = Duration::from_millis(200);
/// Used for queries that old BootROMs silently ignore.
const OPTIONAL_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    BaudEscalated,
}

/// Framed command protocol spoken by the BootROM on top of a [`Channel`].
#[derive(Debug)]
pub struct Connection {
    channel: Channel,
    state: LinkState,
    base_baudrate: u32,
}

impl Connection {
    pub fn new(port: Box<dyn MTKPort>) -> Self {
        Self::from_channel(Channel::new(port))
    }

    pub fn from_channel(channel: Channel) -> Self {
        let base_baudrate = channel.baudrate();
        Connection { channel, state: LinkState::Disconnected, base_baudrate }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.channel.connection_type()
    }

    pub fn channel(&mut self) -> &mut Channel {
        &mut self.channel
    }

    /// Opens the port and performs the start sequence.
    pub async fn connect(&mut self) -> Result<()> {
        self.channel.open().await?;
        self.handshake().await
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.state == LinkState::Disconnected {
            return Ok(());
        }
        self.state = LinkState::Disconnected;
        self.channel.close().await
    }

    /// Sends `A0 0A 50 05`, each byte answered by its complement.
    /// Any unexpected answer restarts the sequence.
    pub async fn handshake(&mut self) -> Result<()> {
        info!("Starting handshake...");

        let mut i = 0;
        let mut sent = 0;

        while i < HANDSHAKE_SEQ.len() {
            if sent >= HANDSHAKE_ATTEMPTS {
                return Err(Error::conn("BootROM did not answer the handshake"));
            }

            self.channel.write(&[HANDSHAKE_SEQ[i]]).await?;
            sent += 1;

            let resp = self.channel.read(Some(1), None).await?;
            let Some(&byte) = resp.first() else {
                i = 0;
                continue;
            };

            if byte == HANDSHAKE_START {
                debug!("Device echoed the start byte, already handshaken");
                break;
            }

            if byte == !HANDSHAKE_SEQ[i] {
                i += 1;
            } else {
                i = 0;
                sleep(Duration::from_millis(5)).await;
            }
        }

        self.state = LinkState::Connected;
        info!("Handshake completed!");
        Ok(())
    }

    /// Writes `data` and expects the same bytes back.
    pub async fn echo(&mut self, data: &[u8]) -> Result<()> {
        self.channel.write(data).await?;
        let got = self.channel.read(Some(data.len()), None).await?;

        if got != data {
            error!("Echo mismatch. Expected: {:02X?}, Got: {:02X?}", data, got);
            return Err(ProtocolError::UnexpectedResponse { expected: data.to_vec(), got }.into());
        }

        Ok(())
    }

    /// Single byte loop-back. The BootROM echoes any byte it does not recognize,
    /// and answers the start byte with its complement while still in handshake mode.
    pub async fn ping(&mut self) -> Result<bool> {
        self.channel.write(&[HANDSHAKE_START]).await?;
        let resp = self.channel.read(Some(1), Some(OPTIONAL_REPLY_TIMEOUT)).await?;
        Ok(matches!(resp.first(), Some(&b) if b == HANDSHAKE_START || b == !HANDSHAKE_START))
    }

    async fn read_status(&mut self) -> Result<u16> {
        self.channel.read_u16_be().await
    }

    async fn expect_status(&mut self, op: &'static str) -> Result<()> {
        let status = self.read_status().await?;
        if status != 0 {
            return Err(Error::nack(op, status));
        }
        Ok(())
    }

    /// Reads `count` 32-bit words starting at `address`.
    pub async fn read32(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        self.echo(&[Command::Read32 as u8]).await?;
        self.echo(&address.to_be_bytes()).await?;
        self.echo(&(count as u32).to_be_bytes()).await?;
        self.expect_status("Read32").await?;

        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(self.channel.read_u32_be().await?);
        }

        self.expect_status("Read32").await?;
        Ok(words)
    }

    pub async fn write32(&mut self, address: u32, words: &[u32]) -> Result<()> {
        self.echo(&[Command::Write32 as u8]).await?;
        self.echo(&address.to_be_bytes()).await?;
        self.echo(&(words.len() as u32).to_be_bytes()).await?;

        let status = self.read_status().await?;
        if status > 0xFF {
            return Err(Error::nack("Write32", status));
        }

        for word in words {
            self.echo(&word.to_be_bytes()).await?;
        }

        let status = self.read_status().await?;
        if status >= 3 {
            return Err(Error::nack("Write32", status));
        }

        Ok(())
    }

    /// Switches a serial line to the fast rate.
    ///
    /// Returns `Ok(false)` when the port is not serial or the device did not follow;
    /// in the latter case the original rate is restored and the link stays usable.
    pub async fn escalate_baud(&mut self) -> Result<bool> {
        if !self.channel.is_serial() {
            debug!("Not a serial line, keeping the current rate");
            return Ok(false);
        }

        if self.state == LinkState::BaudEscalated {
            return Ok(true);
        }

        info!("Switching line rate to {}", ESCALATED_BAUDRATE);
        match self.try_escalate().await {
            Ok(()) => {
                self.state = LinkState::BaudEscalated;
                Ok(true)
            }
            Err(Error::Protocol(e)) => {
                warn!("Baud escalation refused ({}), staying at {}", e, self.base_baudrate);
                self.channel.set_baudrate(self.base_baudrate).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn try_escalate(&mut self) -> Result<()> {
        let mut cmd = vec![Command::ChangeBaud as u8];
        cmd.extend_from_slice(&BAUD_CHANGE_ARGS);
        self.channel.write(&cmd).await?;
        self.expect_byte(ACK).await?;

        self.channel.write(&[ACK]).await?;
        self.channel.set_baudrate(ESCALATED_BAUDRATE).await?;
        sleep(BAUD_SWITCH_DELAY).await;

        for _ in 0..SETTLE_ROUNDS {
            self.channel.write(&[BAUD_SYNC]).await?;
            self.channel.read(Some(1), None).await?;
            sleep(SETTLE_DELAY).await;
        }

        self.channel.write(&[ACK]).await?;
        self.expect_byte(ACK).await
    }

    async fn expect_byte(&mut self, expected: u8) -> Result<()> {
        let got = self.channel.read(Some(1), None).await?;
        if got != [expected] {
            return Err(ProtocolError::UnexpectedResponse { expected: vec![expected], got }.into());
        }
        Ok(())
    }

    pub async fn get_hw_code(&mut self) -> Result<u16> {
        self.echo(&[Command::GetHwCode as u8]).await?;

        let hw_code = self.channel.read_u16_be().await?;
        self.expect_status("GetHwCode").await?;

        Ok(hw_code)
    }

    /// Returns `(hw_sub_code, hw_ver, sw_ver)`.
    pub async fn get_hw_sw_ver(&mut self) -> Result<(u16, u16, u16)> {
        self.echo(&[Command::GetHwSwVer as u8]).await?;

        let hw_sub_code = self.channel.read_u16_be().await?;
        let hw_ver = self.channel.read_u16_be().await?;
        let sw_ver = self.channel.read_u16_be().await?;
        self.expect_status("GetHwSwVer").await?;

        Ok((hw_sub_code, hw_ver, sw_ver))
    }

    /// Returns the target configuration of the device.
    /// This configuration can be interpreted as follows:
    ///
    /// SBC = target_config & 0x1
    /// SLA = target_config & 0x2
    /// DAA = target_config & 0x4
    pub async fn get_target_config(&mut self) -> Result<u32> {
        self.echo(&[Command::GetTargetConfig as u8]).await?;

        let config = self.channel.read_u32_be().await?;
        self.expect_status("GetTargetConfig").await?;

        Ok(config)
    }

    pub async fn get_meid(&mut self) -> Result<Vec<u8>> {
        self.get_id(Command::GetMeId, "GetMeid").await
    }

    pub async fn get_soc_id(&mut self) -> Result<Vec<u8>> {
        self.get_id(Command::GetSocId, "GetSocId").await
    }

    /// Length-prefixed id query. An empty result means the BootROM does not know the command.
    async fn get_id(&mut self, cmd: Command, op: &'static str) -> Result<Vec<u8>> {
        self.echo(&[cmd as u8]).await?;

        let len = self.channel.read(Some(4), Some(OPTIONAL_REPLY_TIMEOUT)).await?;
        if len.len() != 4 {
            debug!("{} not supported by this BootROM", op);
            return Ok(Vec::new());
        }

        let length = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        let id = self.channel.read_exact(length).await?;
        self.expect_status(op).await?;

        Ok(id)
    }
}
