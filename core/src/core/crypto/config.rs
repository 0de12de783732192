/*
    SPDX-License-Identifier: GPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy

    Derived from:
    https://github.com/bkerler/mtkclient/blob/main/mtkclient/Library/Hardware/hwcrypto.py
    Original SPDX-License-Identifier: GPL-3.0-or-later
    Original SPDX-FileCopyrightText: 2018–2024 bkerler

    This file remains under the GPL-3.0-or-later license.
    However, as part of a larger project licensed under the AGPL-3.0-or-later,
    the combined work is subject to the networking terms of the AGPL-3.0-or-later,
    as for term 13 of the GPL-3.0-or-later license.
*/
use std::time::Duration;

use crate::error::Result;
use crate::utilities::CancelToken;

/// 32-bit register access to the device, as granted by the exploit.
#[async_trait::async_trait]
pub trait CryptoIO: Send {
    async fn read32(&mut self, addr: u32) -> Result<u32>;
    async fn write32(&mut self, addr: u32, val: u32) -> Result<()>;

    async fn read_words(&mut self, addr: u32, count: usize) -> Result<Vec<u32>> {
        let mut words = Vec::with_capacity(count);
        for i in 0..count {
            words.push(self.read32(addr + (i as u32) * 4).await?);
        }
        Ok(words)
    }

    async fn write_words(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        for (i, word) in words.iter().enumerate() {
            self.write32(addr + (i as u32) * 4, *word).await?;
        }
        Ok(())
    }
}

/// Bounds every busy-wait on engine status bits.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub timeout: Duration,
    /// Delay between two reads of the status register. Zero spins.
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig { timeout: Duration::from_secs(2), interval: Duration::ZERO }
    }
}

/// Everything an engine driver needs besides the register window.
pub struct CryptoConfig<'a> {
    pub io: &'a mut dyn CryptoIO,
    pub hw_code: u16,
    pub poll: PollConfig,
    pub cancel: CancelToken,
}

impl<'a> CryptoConfig<'a> {
    pub fn new(io: &'a mut dyn CryptoIO, hw_code: u16) -> Self {
        Self { io, hw_code, poll: PollConfig::default(), cancel: CancelToken::new() }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}
