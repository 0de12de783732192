/*
    SPDX-License-Identifier: GPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy

    Derived from:
    https://github.com/bkerler/mtkclient/blob/main/mtkclient/Library/Hardware/hwcrypto_sej.py
    Original SPDX-License-Identifier: GPL-3.0-or-later
    Original SPDX-FileCopyrightText: 2018–2024 bkerler

    This file remains under the GPL-3.0-or-later license.
    However, as part of a larger project licensed under the AGPL-3.0-or-later,
    the combined work is subject to the networking terms of the AGPL-3.0-or-later,
    as for term 13 of the GPL-3.0-or-later license.
*/
use log::debug;

use crate::core::crypto::config::{CryptoConfig, CryptoIO, PollConfig};
use crate::core::crypto::registers::{RegisterMap, Registers};
use crate::error::{Error, Result};
use crate::utilities::CancelToken;
use crate::utilities::bytes::{from_words, to_words};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SejReg {
    Con,
    Acon,
    Acon2,
    Aconk,
    Asrc(u8),
    Akey(u8),
    Acfg(u8),
    Aout(u8),
    SwOtp(u8),
    SecInit(u8),
    Mkj,
    Unk,
}

impl RegisterMap for SejReg {
    fn offset(self) -> u32 {
        match self {
            SejReg::Con => 0x00,
            SejReg::Acon => 0x04,
            SejReg::Acon2 => 0x08,
            SejReg::Aconk => 0x0C,
            SejReg::Asrc(n) => 0x10 + 4 * n as u32,
            SejReg::Akey(n) => 0x20 + 4 * n as u32,
            SejReg::Acfg(n) => 0x40 + 4 * n as u32,
            SejReg::Aout(n) => 0x50 + 4 * n as u32,
            SejReg::SwOtp(n) => 0x60 + 4 * n as u32,
            SejReg::SecInit(n) => 0x80 + 4 * n as u32,
            SejReg::Mkj => 0xA0,
            SejReg::Unk => 0xBC,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SejReg::Acon2 => "HACC_ACON2",
            SejReg::Aout(_) => "HACC_AOUT",
            _ => "HACC",
        }
    }
}

pub const HACC_AES_DEC: u32 = 0x0;
pub const HACC_AES_ENC: u32 = 0x1;
pub const HACC_AES_CBC: u32 = 0x2;
pub const HACC_AES_128: u32 = 0x0;
pub const HACC_AES_CHG_BO_OFF: u32 = 0x0;

pub const HACC_AES_START: u32 = 0x1;
pub const HACC_AES_CLR: u32 = 0x2;
pub const HACC_AES_RDY: u32 = 0x8000;

pub const HACC_AES_BK2C: u32 = 0x10;
pub const HACC_AES_R2K: u32 = 0x100;

const SECINIT_MAGIC: [u32; 3] = [0xAE0A_CBEA, 0xCD95_7018, 0x4629_3911];

const CFG_RANDOM_PATTERN: [u32; 12] = [
    0x2D44_BB70, 0xA744_D227, 0xD0A9_864B, 0x83FF_C244, 0x7EC8_266B, 0x43E8_0FB2, 0x01A6_348A,
    0x2067_F9A0, 0x5453_6405, 0xD546_A6B1, 0x1CC3_EC3A, 0xDE37_7A83,
];

/// Initial vector words for the different key flavours.
pub type HaccCfg = [u32; 4];

pub const HACC_CFG_1: HaccCfg = [0x9ED4_0400, 0x00E8_84A1, 0xE3F0_83BD, 0x2F4E_6D8A];
pub const HACC_CFG_MTEE: HaccCfg = [0x9ED4_0400, 0x00E8_84A1, 0xE3F0_83BD, 0x2F4E_6D8A];
pub const HACC_CFG_2: HaccCfg = [0xAA54_2CDA, 0x5552_2114, 0xE3F0_83BD, 0x5552_2114];
pub const HACC_CFG_3: HaccCfg = [0x2684_B690, 0xEB67_A8BE, 0xA113_144C, 0x177B_1215];

pub struct Sej<'a> {
    io: &'a mut dyn CryptoIO,
    base: u32,
    poll: PollConfig,
    cancel: CancelToken,
}

impl<'a> Sej<'a> {
    pub fn new(config: CryptoConfig<'a>, base: u32) -> Self {
        Sej { io: config.io, base, poll: config.poll, cancel: config.cancel }
    }

    fn regs(&mut self) -> Registers<'_, SejReg> {
        Registers::new(&mut *self.io, self.base)
    }

    /// Loads the software OTP the hardware key is bound to.
    pub async fn set_otp(&mut self, otp: &[u8; 32]) -> Result<()> {
        let words = to_words(otp);
        let mut r = self.regs();
        for (n, word) in words.iter().enumerate() {
            r.write(SejReg::SwOtp(n as u8), *word).await?;
        }
        for (n, magic) in SECINIT_MAGIC.iter().enumerate() {
            r.write(SejReg::SecInit(n as u8), *magic).await?;
        }
        Ok(())
    }

    async fn wait_ready(&mut self) -> Result<()> {
        let poll = self.poll.clone();
        let cancel = self.cancel.clone();
        self.regs().poll(SejReg::Acon2, &poll, &cancel, |v| v & HACC_AES_RDY != 0).await?;
        Ok(())
    }

    async fn write_cfg(&mut self, cfg: &HaccCfg) -> Result<()> {
        let mut r = self.regs();
        for (n, word) in cfg.iter().enumerate() {
            r.write(SejReg::Acfg(n as u8), *word).await?;
        }
        Ok(())
    }

    /// Binds the hardware unique key and primes the engine with the random pattern.
    pub async fn init(&mut self, encrypt: bool, cfg: &HaccCfg, legacy: bool) -> Result<()> {
        let mut setting = HACC_AES_CHG_BO_OFF | HACC_AES_128 | HACC_AES_CBC;
        setting |= if encrypt { HACC_AES_ENC } else { HACC_AES_DEC };

        let poll = self.poll.clone();
        let cancel = self.cancel.clone();

        {
            let mut r = self.regs();
            for n in 0..8 {
                r.write(SejReg::Akey(n), 0).await?;
            }

            r.write(SejReg::Acon, HACC_AES_CHG_BO_OFF | HACC_AES_CBC | HACC_AES_128 | HACC_AES_DEC)
                .await?;
            r.write(SejReg::Aconk, HACC_AES_BK2C | HACC_AES_R2K).await?;

            if legacy {
                r.update(SejReg::Unk, |v| v | 2).await?;
                r.write(SejReg::Acon2, 0x4000_0000 | HACC_AES_CLR).await?;
                r.poll(SejReg::Acon2, &poll, &cancel, |v| v <= 0x8000_0000).await?;
            } else {
                r.update(SejReg::Unk, |v| v | 1).await?;
            }

            r.write(SejReg::Acon2, HACC_AES_CLR).await?;
        }
        self.write_cfg(cfg).await?;

        for round in CFG_RANDOM_PATTERN.chunks(4) {
            let mut r = self.regs();
            for (n, word) in round.iter().enumerate() {
                r.write(SejReg::Asrc(n as u8), *word).await?;
            }
            r.write(SejReg::Acon2, HACC_AES_START).await?;
            self.wait_ready().await?;
        }

        self.regs().write(SejReg::Acon2, HACC_AES_CLR).await?;
        self.write_cfg(cfg).await?;

        let mut r = self.regs();
        r.write(SejReg::Acon, setting).await?;
        r.write(SejReg::Aconk, 0).await?;
        Ok(())
    }

    /// Pushes `data` through the engine one 16-byte block at a time.
    pub async fn run(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % 16 != 0 {
            return Err(Error::umbra(format!(
                "SEJ input must be a multiple of 16 bytes, got {}",
                data.len()
            )));
        }

        let mut out = Vec::with_capacity(data.len());
        for block in data.chunks(16) {
            {
                let mut r = self.regs();
                for (n, word) in to_words(block).iter().enumerate() {
                    r.write(SejReg::Asrc(n as u8), *word).await?;
                }
                r.write(SejReg::Acon2, HACC_AES_START).await?;
            }
            self.wait_ready().await?;

            let words = self.regs().read_block(SejReg::Aout(0), 4).await?;
            out.extend(from_words(&words));
        }
        Ok(out)
    }

    pub async fn terminate(&mut self) -> Result<()> {
        let mut r = self.regs();
        r.write(SejReg::Acon2, HACC_AES_CLR).await?;
        for n in 0..8 {
            r.write(SejReg::Akey(n), 0).await?;
        }
        Ok(())
    }

    /// One full init/run/terminate cycle. The engine is terminated even when the run fails.
    pub async fn aes128_cbc(
        &mut self,
        data: &[u8],
        encrypt: bool,
        cfg: &HaccCfg,
        legacy: bool,
    ) -> Result<Vec<u8>> {
        debug!("SEJ {} of {} bytes (legacy: {})", if encrypt { "encrypt" } else { "decrypt" }, data.len(), legacy);

        self.init(encrypt, cfg, legacy).await?;
        let result = self.run(data).await;
        let terminated = self.terminate().await;

        let out = result?;
        terminated?;
        Ok(out)
    }
}
