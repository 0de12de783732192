/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt::Debug;
use std::marker::PhantomData;

use log::debug;
use tokio::time::{Instant, sleep};

use crate::core::crypto::config::{CryptoIO, PollConfig};
use crate::error::{CryptoEngineFault, Result};
use crate::utilities::CancelToken;

/// A named register bank with fixed offsets from a base address.
pub trait RegisterMap: Copy + Debug + Send {
    fn offset(self) -> u32;
    fn name(self) -> &'static str;
}

/// Typed view of one register bank.
pub struct Registers<'a, R: RegisterMap> {
    io: &'a mut dyn CryptoIO,
    base: u32,
    _map: PhantomData<R>,
}

impl<'a, R: RegisterMap> Registers<'a, R> {
    pub fn new(io: &'a mut dyn CryptoIO, base: u32) -> Self {
        Registers { io, base, _map: PhantomData }
    }

    pub fn addr(&self, reg: R) -> u32 {
        self.base + reg.offset()
    }

    pub async fn read(&mut self, reg: R) -> Result<u32> {
        self.io.read32(self.base + reg.offset()).await
    }

    pub async fn write(&mut self, reg: R, value: u32) -> Result<()> {
        self.io.write32(self.base + reg.offset(), value).await
    }

    /// Read-modify-write.
    pub async fn update<F>(&mut self, reg: R, f: F) -> Result<u32>
    where
        F: FnOnce(u32) -> u32 + Send,
    {
        let value = f(self.read(reg).await?);
        self.write(reg, value).await?;
        Ok(value)
    }

    pub async fn write_block(&mut self, reg: R, words: &[u32]) -> Result<()> {
        self.io.write_words(self.base + reg.offset(), words).await
    }

    pub async fn read_block(&mut self, reg: R, count: usize) -> Result<Vec<u32>> {
        self.io.read_words(self.base + reg.offset(), count).await
    }

    /// Reads `reg` until `done` holds, returning the last value read.
    pub async fn poll<F>(
        &mut self,
        reg: R,
        cfg: &PollConfig,
        cancel: &CancelToken,
        done: F,
    ) -> Result<u32>
    where
        F: Fn(u32) -> bool + Send,
    {
        let started = Instant::now();

        loop {
            cancel.check()?;

            let value = self.read(reg).await?;
            if done(value) {
                return Ok(value);
            }

            let waited = started.elapsed();
            if waited >= cfg.timeout {
                debug!("Gave up polling {:?} after {:?}, last 0x{:08X}", reg, waited, value);
                return Err(CryptoEngineFault::Timeout {
                    what: reg.name(),
                    waited_ms: waited.as_millis(),
                }
                .into());
            }

            if !cfg.interval.is_zero() {
                sleep(cfg.interval).await;
            }
        }
    }
}
