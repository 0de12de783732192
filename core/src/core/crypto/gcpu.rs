/*
    SPDX-License-Identifier: GPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy

    Derived from:
    https://github.com/bkerler/mtkclient/blob/main/mtkclient/Library/Hardware/hwcrypto_gcpu.py
    Original SPDX-License-Identifier: GPL-3.0-or-later
    Original SPDX-FileCopyrightText: 2018–2024 bkerler

    This file remains under the GPL-3.0-or-later license.
    However, as part of a larger project licensed under the AGPL-3.0-or-later,
    the combined work is subject to the networking terms of the AGPL-3.0-or-later,
    as for term 13 of the GPL-3.0-or-later license.
*/
use log::{debug, info, warn};

use crate::core::chip::{BlacklistEntry, SlotTable};
use crate::core::crypto::config::{CryptoConfig, CryptoIO, PollConfig};
use crate::core::crypto::registers::{RegisterMap, Registers};
use crate::error::{CryptoEngineFault, Error, Result};
use crate::utilities::CancelToken;
use crate::utilities::bytes::{from_words, to_words};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcpuReg {
    Ctl,
    Msc,
    Unk1,
    Unk2,
    PcCtl,
    MemAddr,
    MemData,
    ReadReg,
    MonCtl,
    DramMon,
    Cyc,
    DramInstBase,
    TrapStart,
    TrapEnd,
    IntSet,
    IntClr,
    IntEn,
    Unk3,
    MemCmd,
    /// Operand registers P0..=P14.
    Param(u8),
    Slot,
}

impl RegisterMap for GcpuReg {
    fn offset(self) -> u32 {
        match self {
            GcpuReg::Ctl => 0x000,
            GcpuReg::Msc => 0x004,
            GcpuReg::Unk1 => 0x020,
            GcpuReg::Unk2 => 0x024,
            GcpuReg::PcCtl => 0x400,
            GcpuReg::MemAddr => 0x404,
            GcpuReg::MemData => 0x408,
            GcpuReg::ReadReg => 0x410,
            GcpuReg::MonCtl => 0x414,
            GcpuReg::DramMon => 0x418,
            GcpuReg::Cyc => 0x41C,
            GcpuReg::DramInstBase => 0x420,
            GcpuReg::TrapStart => 0x440,
            GcpuReg::TrapEnd => 0x478,
            GcpuReg::IntSet => 0x800,
            GcpuReg::IntClr => 0x804,
            GcpuReg::IntEn => 0x808,
            GcpuReg::Unk3 => 0x80C,
            GcpuReg::MemCmd => 0xC00,
            GcpuReg::Param(n) => 0xC04 + 4 * n as u32,
            GcpuReg::Slot => 0xC40,
        }
    }

    fn name(self) -> &'static str {
        match self {
            GcpuReg::Ctl => "GCPU_REG_CTL",
            GcpuReg::Msc => "GCPU_REG_MSC",
            GcpuReg::PcCtl => "GCPU_REG_PC_CTL",
            GcpuReg::DramMon => "GCPU_REG_DRAM_MON",
            GcpuReg::IntSet => "GCPU_REG_INT_SET",
            GcpuReg::IntClr => "GCPU_REG_INT_CLR",
            GcpuReg::MemCmd => "GCPU_REG_MEM_CMD",
            GcpuReg::Param(_) => "GCPU_REG_MEM_Pn",
            _ => "GCPU",
        }
    }
}

pub const MAX_OPERANDS: usize = 14;
const INT_MASK: u32 = 3;
const CLR_EN: u32 = 3;

const CKSYS_BASE: u32 = 0x1000_0000;
const CLR_CLK_GATING_CTRL2: u32 = CKSYS_BASE + 0x09C;

const OP_GCPU_WRITE: u8 = 0x6E;
const OP_LOAD_HW_KEY: u8 = 0x70;
const OP_AESPK_DPAK: u8 = 0x7A;
const OP_AESPK_EPAK: u8 = 0x7B;

/// Scratch index the BootROM keeps the predetermined key at.
pub const PREDETERMINED_KEY_SLOT: u32 = 0x58;

pub(crate) const DEFAULT_SETUP_IV: [u8; 16] = [
    0x4D, 0xD1, 0x2B, 0xDF, 0x0E, 0xC7, 0xD2, 0x6C, 0x48, 0x24, 0x90, 0xB3, 0x48, 0x2A, 0x1B, 0x1F,
];

pub const MTEE_LABEL: &[u8; 32] = b"www.mediatek.com0123456789ABCDEF";
const MTEE_SRC: u32 = 0x5019_A180;
const MTEE_DST: u32 = 0x5019_A200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    Ecb,
    Cbc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKey {
    Predetermined,
    PredeterminedEncrypted,
}

/// The engine's AES instruction set for key derivation.
pub const fn opcode(direction: Direction, mode: CipherMode, key: EngineKey) -> u8 {
    use CipherMode::*;
    use Direction::*;
    use EngineKey::*;

    match (direction, mode, key) {
        (Encrypt, Ecb, Predetermined) => 0x79,
        (Encrypt, Ecb, PredeterminedEncrypted) => 0x77,
        (Encrypt, Cbc, Predetermined) => 0x7D,
        (Encrypt, Cbc, PredeterminedEncrypted) => 0x7F,
        (Decrypt, Ecb, Predetermined) => 0x78,
        (Decrypt, Ecb, PredeterminedEncrypted) => 0x76,
        (Decrypt, Cbc, Predetermined) => 0x7C,
        (Decrypt, Cbc, PredeterminedEncrypted) => 0x7E,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Key,
    Seed,
    Iv,
    HwKey,
}

impl KeySlot {
    pub fn index(self, table: &SlotTable) -> u32 {
        match self {
            KeySlot::Key => table.key,
            KeySlot::Seed => table.seed,
            KeySlot::Iv => table.iv,
            KeySlot::HwKey => table.hw_key,
        }
    }
}

/// Clock/reset sequence variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetQuirk {
    /// Ungate the GCPU clock first.
    ClockGate,
    ReleaseFirst,
    PkInit,
    Generic,
}

impl ResetQuirk {
    pub fn for_hw_code(hw_code: u16) -> Self {
        match hw_code {
            0x8167 => ResetQuirk::ClockGate,
            0x8172 | 0x8127 => ResetQuirk::ReleaseFirst,
            0x0335 => ResetQuirk::PkInit,
            _ => ResetQuirk::Generic,
        }
    }
}

pub struct Gcpu<'a> {
    io: &'a mut dyn CryptoIO,
    base: u32,
    hw_code: u16,
    slots: SlotTable,
    poll: PollConfig,
    cancel: CancelToken,
}

impl<'a> Gcpu<'a> {
    pub fn new(config: CryptoConfig<'a>, base: u32, slots: SlotTable) -> Self {
        Gcpu {
            io: config.io,
            base,
            hw_code: config.hw_code,
            slots,
            poll: config.poll,
            cancel: config.cancel,
        }
    }

    fn regs(&mut self) -> Registers<'_, GcpuReg> {
        Registers::new(&mut *self.io, self.base)
    }

    pub fn slot(&self, slot: KeySlot) -> u32 {
        slot.index(&self.slots)
    }

    fn scratch_addr(&self, index: u32) -> u32 {
        self.base + GcpuReg::MemCmd.offset() + index * 4
    }

    /// Plain reset: gate everything off, then enable clocks.
    pub async fn reset(&mut self) -> Result<()> {
        let mut r = self.regs();
        r.update(GcpuReg::Ctl, |v| v & !0xF).await?;
        r.update(GcpuReg::Ctl, |v| v | 0xF).await?;
        r.update(GcpuReg::Ctl, |v| v & !0x1F).await?;
        r.update(GcpuReg::Msc, |v| v | (1 << 16)).await?;
        r.update(GcpuReg::Ctl, |v| v | 0x1F).await?;
        Ok(())
    }

    /// Chip specific bring-up before the first command.
    pub async fn acquire(&mut self) -> Result<()> {
        let quirk = ResetQuirk::for_hw_code(self.hw_code);
        debug!("Acquiring GCPU with {:?} sequence", quirk);

        match quirk {
            ResetQuirk::ClockGate => {
                let gate = self.io.read32(CLR_CLK_GATING_CTRL2).await?;
                self.io.write32(CLR_CLK_GATING_CTRL2, gate | 0x0800_0000).await?;
                self.generic_acquire().await
            }
            ResetQuirk::ReleaseFirst => {
                self.release().await?;
                self.regs().update(GcpuReg::Msc, |v| v & 0xFFFF_DFFF).await?;
                Ok(())
            }
            ResetQuirk::PkInit => {
                let mut r = self.regs();
                let msc = r.read(GcpuReg::Msc).await?;
                r.write(GcpuReg::Ctl, msc & 0xFFFF_DFFF).await?;
                r.update(GcpuReg::Ctl, |v| v | 7).await?;
                r.write(GcpuReg::Msc, 0x80FF_1800).await?;
                r.write(GcpuReg::Unk1, 0x887F).await?;
                r.write(GcpuReg::Unk2, 0).await?;
                Ok(())
            }
            ResetQuirk::Generic => self.generic_acquire().await,
        }
    }

    async fn generic_acquire(&mut self) -> Result<()> {
        let mut r = self.regs();
        r.update(GcpuReg::Ctl, |v| v & 0xFFFF_FFF0).await?;
        r.update(GcpuReg::Ctl, |v| v | 0xF).await?;
        r.update(GcpuReg::Msc, |v| v | 0x10000).await?;
        r.update(GcpuReg::Ctl, |v| v & 0xFFFF_FFE0).await?;
        r.update(GcpuReg::Msc, |v| v | 0x10000).await?;
        r.update(GcpuReg::Ctl, |v| v | 0x1F).await?;
        r.update(GcpuReg::Msc, |v| v | 0x2000).await?;
        Ok(())
    }

    pub async fn release(&mut self) -> Result<()> {
        let mut r = self.regs();
        r.update(GcpuReg::Ctl, |v| v & 0xFFFF_FFF0).await?;
        r.update(GcpuReg::Ctl, |v| v | 0xF).await?;
        Ok(())
    }

    /// Zeroes the operand registers and the key, seed and IV slots.
    pub async fn init(&mut self) -> Result<()> {
        let mut r = self.regs();
        for n in 2..=10 {
            r.write(GcpuReg::Param(n), 0).await?;
        }

        let key = self.slot(KeySlot::Key);
        let seed = self.slot(KeySlot::Seed);
        let iv = self.slot(KeySlot::Iv);
        self.memptr_set(key, &[0; 4]).await?;
        self.memptr_set(seed, &[0; 4]).await?;
        self.memptr_set(iv, &[0; 8]).await?;
        Ok(())
    }

    pub async fn uninit(&mut self) -> Result<()> {
        self.regs().update(GcpuReg::Ctl, |v| (v & 0xFFFF_FFF0) | 0xF).await?;
        Ok(())
    }

    async fn memptr_set(&mut self, index: u32, words: &[u32]) -> Result<()> {
        let addr = self.scratch_addr(index);
        self.io.write_words(addr, words).await
    }

    async fn memptr_get(&mut self, index: u32, count: usize) -> Result<Vec<u32>> {
        let addr = self.scratch_addr(index);
        self.io.read_words(addr, count).await
    }

    /// Stores `data` as little-endian words in `slot`.
    pub async fn set_key_material(&mut self, slot: KeySlot, data: &[u8]) -> Result<()> {
        let index = self.slot(slot);
        self.memptr_set(index, &to_words(data)).await
    }

    pub async fn get_key_material(&mut self, slot: KeySlot, len: usize) -> Result<Vec<u8>> {
        let index = self.slot(slot);
        let words = self.memptr_get(index, len.div_ceil(4)).await?;
        let mut data = from_words(&words);
        data.truncate(len);
        Ok(data)
    }

    pub async fn clear_slot(&mut self, slot: KeySlot) -> Result<()> {
        let len = if slot == KeySlot::Iv { 8 } else { 4 };
        let index = self.slot(slot);
        self.memptr_set(index, &vec![0; len]).await
    }

    /// Writes to engine memory. Bit 31 of `MEM_ADDR` selects write mode,
    /// and only addresses with bit 13 set are writable.
    pub async fn mem_write(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        if addr & (1 << 13) == 0 {
            warn!("GCPU memory address 0x{:08X} lacks bit 13", addr);
            return Err(CryptoEngineFault::OperationFailed { opcode: OP_GCPU_WRITE }.into());
        }

        let mut r = self.regs();
        r.write(GcpuReg::MemAddr, (1 << 31) | addr).await?;
        for word in words {
            r.write(GcpuReg::MemData, *word).await?;
        }
        Ok(())
    }

    pub async fn mem_read(&mut self, addr: u32, count: usize) -> Result<Vec<u32>> {
        let mut r = self.regs();
        r.write(GcpuReg::MemAddr, addr & !(1 << 31)).await?;

        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(r.read(GcpuReg::MemData).await?);
        }
        Ok(words)
    }

    /// Runs one engine command and waits for it to complete.
    pub async fn dispatch(&mut self, opcode: u8, operands: &[u32]) -> Result<()> {
        if operands.len() > MAX_OPERANDS {
            return Err(Error::umbra(format!(
                "GCPU takes at most {} operands, got {}",
                MAX_OPERANDS,
                operands.len()
            )));
        }

        debug!("GCPU dispatch 0x{:02X} {:08X?}", opcode, operands);

        let poll = self.poll.clone();
        let cancel = self.cancel.clone();
        let mut r = self.regs();

        for (n, value) in operands.iter().enumerate() {
            r.write(GcpuReg::Param(n as u8), *value).await?;
        }

        r.write(GcpuReg::IntClr, CLR_EN).await?;
        r.write(GcpuReg::IntEn, INT_MASK).await?;
        r.write(GcpuReg::MemCmd, opcode as u32).await?;
        r.write(GcpuReg::PcCtl, 0).await?;

        let mut status = r.poll(GcpuReg::IntSet, &poll, &cancel, |v| v != 0).await?;

        if status & 2 != 0 {
            if status & 1 == 0 {
                status = r.poll(GcpuReg::IntSet, &poll, &cancel, |v| v != 0).await?;
            }
            r.write(GcpuReg::IntClr, CLR_EN).await?;
            debug!("GCPU command 0x{:02X} failed, INT_SET 0x{:X}", opcode, status);
            return Err(CryptoEngineFault::OperationFailed { opcode }.into());
        }

        r.poll(GcpuReg::DramMon, &poll, &cancel, |v| v & 1 != 0).await?;
        r.write(GcpuReg::IntClr, CLR_EN).await?;
        Ok(())
    }

    /// CBC over engine memory, operands P0 src, P1 dst, P2 blocks, P4 key, P5/P6 IV.
    pub async fn aes_cbc(
        &mut self,
        direction: Direction,
        src: u32,
        dst: u32,
        blocks: u32,
        key_slot: u32,
        iv_slot: u32,
    ) -> Result<()> {
        let op = opcode(direction, CipherMode::Cbc, EngineKey::PredeterminedEncrypted);
        self.dispatch(op, &[src, dst, blocks, 0, key_slot, iv_slot, iv_slot]).await
    }

    /// Single block ECB between scratch slots.
    pub async fn aes_ecb(
        &mut self,
        direction: Direction,
        key_slot: u32,
        data_slot: u32,
        out_slot: u32,
    ) -> Result<()> {
        let op = opcode(direction, CipherMode::Ecb, EngineKey::Predetermined);
        let decrypt = (direction == Direction::Decrypt) as u32;
        self.dispatch(op, &[decrypt, key_slot, data_slot, out_slot]).await
    }

    /// Copies the hardware-resident key into `slot`.
    pub async fn load_hw_key(&mut self, slot: KeySlot) -> Result<()> {
        let dst = self.slot(slot);
        self.dispatch(OP_LOAD_HW_KEY, &[PREDETERMINED_KEY_SLOT, dst, 4]).await
    }

    /// Makes the engine write a chosen 16-byte block to `addr`
    /// by CBC-decrypting a zero block with a crafted IV.
    pub async fn aes_setup_cbc(&mut self, addr: u32, data: &[u8; 16], iv: Option<&[u8; 16]>) -> Result<()> {
        let iv = to_words(iv.unwrap_or(&DEFAULT_SETUP_IV));
        let words: Vec<u32> = to_words(data).iter().zip(&iv).map(|(d, p)| d ^ p).collect();

        let key = self.slot(KeySlot::Key);
        let seed = self.slot(KeySlot::Seed);
        let iv_slot = self.slot(KeySlot::Iv);
        self.memptr_set(key, &[0; 4]).await?;
        self.memptr_set(seed, &[0; 4]).await?;
        self.memptr_set(iv_slot, &[0; 8]).await?;
        self.memptr_set(iv_slot, &words).await?;

        // BootROM block that decrypts to the default IV under a zero key
        let src = if self.hw_code == 0x8172 { 0xD848 } else { 0 };
        self.aes_cbc(Direction::Decrypt, src, addr, 1, key, iv_slot).await
    }

    pub async fn disable_range_blacklist(&mut self, blacklist: &[BlacklistEntry]) -> Result<()> {
        info!("Disabling bootrom range checks..");
        for entry in blacklist {
            debug!("Patching range check at 0x{:08X}", entry.addr);
            let data: [u8; 16] = from_words(&entry.words)
                .try_into()
                .map_err(|_| Error::umbra("Blacklist entry is not four words"))?;
            self.aes_setup_cbc(entry.addr, &data, None).await?;
        }
        Ok(())
    }

    /// ECB with the predetermined key over engine memory, completion signalled on INT_CLR.
    pub async fn aes_pk_ecb(&mut self, direction: Direction, src: u32, dst: u32, len: u32) -> Result<()> {
        let op = match direction {
            Direction::Encrypt => OP_AESPK_EPAK,
            Direction::Decrypt => OP_AESPK_DPAK,
        };

        let poll = self.poll.clone();
        let cancel = self.cancel.clone();
        let mut r = self.regs();

        r.update(GcpuReg::Ctl, |v| v & 0xFFFF_FFF8).await?;
        r.update(GcpuReg::Ctl, |v| v | 7).await?;
        r.write(GcpuReg::Msc, 0x80FF_1800).await?;
        r.write(GcpuReg::Unk1, 0x887F).await?;
        r.write(GcpuReg::Unk2, 0).await?;
        for v in [0xFFFF_FFFF, 0xFFFF_FFFF, 0xFFFF_FFFF, 2] {
            r.write(GcpuReg::Unk3, v).await?;
        }
        r.update(GcpuReg::Msc, |v| v | 0x2000).await?;

        r.write(GcpuReg::MemCmd, op as u32).await?;
        r.write(GcpuReg::Param(0), src).await?;
        r.write(GcpuReg::Param(1), dst).await?;
        r.write(GcpuReg::Param(2), len / 16).await?;
        r.write(GcpuReg::Param(3), 0).await?;
        r.write(GcpuReg::Param(4), 0).await?;
        r.write_block(GcpuReg::Param(5), &[0; 9]).await?;
        r.write(GcpuReg::PcCtl, 0).await?;

        let status = r.poll(GcpuReg::IntClr, &poll, &cancel, |v| v != 0).await?;
        r.write(GcpuReg::IntClr, status).await?;

        r.write_block(GcpuReg::MemCmd, &[0; 0xE0]).await?;
        r.write(GcpuReg::IntEn, 0).await?;
        r.write(GcpuReg::Msc, 0x80FE_1800).await?;
        Ok(())
    }

    /// Encrypts the fixed label with the predetermined key, giving the TEE key on older SoCs.
    pub async fn mtee_label_key(&mut self) -> Result<Vec<u8>> {
        self.acquire().await?;
        self.io.write_words(MTEE_SRC, &to_words(MTEE_LABEL)).await?;
        self.aes_pk_ecb(Direction::Encrypt, MTEE_SRC, MTEE_DST, MTEE_LABEL.len() as u32).await?;
        let words = self.io.read_words(MTEE_DST, 8).await?;
        Ok(from_words(&words))
    }

    /// Decrypts `seed` under the hardware key, or the predetermined key when the
    /// hardware key cannot be loaded. The engine is left uninitialized either way.
    pub async fn scrambled_key(&mut self, seed: &[u8; 16]) -> Result<[u8; 16]> {
        self.init().await?;
        let result = self.scrambled_key_inner(seed).await;
        let uninit = self.uninit().await;

        let key = result?;
        uninit?;
        Ok(key)
    }

    async fn scrambled_key_inner(&mut self, seed: &[u8; 16]) -> Result<[u8; 16]> {
        let key_slot = match self.load_hw_key(KeySlot::HwKey).await {
            Ok(()) => self.slot(KeySlot::HwKey),
            Err(e) if !e.is_fatal() => {
                warn!("gcpu_load_hw_key failed ({}), using the predetermined key", e);
                PREDETERMINED_KEY_SLOT
            }
            Err(e) => return Err(e),
        };

        self.set_key_material(KeySlot::Key, seed).await?;
        let (data, out) = (self.slot(KeySlot::Key), self.slot(KeySlot::Iv));
        self.aes_ecb(Direction::Decrypt, key_slot, data, out).await?;

        let key = self.get_key_material(KeySlot::Iv, 16).await?;
        self.clear_slot(KeySlot::Key).await?;

        key.try_into().map_err(|_| Error::umbra("Short read of the scrambled key"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::core::chip::DEFAULT_SLOTS;
    use crate::sim::SimBrom;

    const ALL: [(Direction, CipherMode, EngineKey); 8] = [
        (Direction::Encrypt, CipherMode::Ecb, EngineKey::Predetermined),
        (Direction::Encrypt, CipherMode::Ecb, EngineKey::PredeterminedEncrypted),
        (Direction::Encrypt, CipherMode::Cbc, EngineKey::Predetermined),
        (Direction::Encrypt, CipherMode::Cbc, EngineKey::PredeterminedEncrypted),
        (Direction::Decrypt, CipherMode::Ecb, EngineKey::Predetermined),
        (Direction::Decrypt, CipherMode::Ecb, EngineKey::PredeterminedEncrypted),
        (Direction::Decrypt, CipherMode::Cbc, EngineKey::Predetermined),
        (Direction::Decrypt, CipherMode::Cbc, EngineKey::PredeterminedEncrypted),
    ];

    #[test]
    fn test_opcode_table_is_complete_and_distinct() {
        let ops: HashSet<u8> = ALL.iter().map(|&(d, m, k)| opcode(d, m, k)).collect();
        assert_eq!(ops.len(), 8);
        assert_eq!(
            ops,
            HashSet::from([0x76, 0x77, 0x78, 0x79, 0x7C, 0x7D, 0x7E, 0x7F])
        );
    }

    #[test]
    fn test_param_offsets() {
        assert_eq!(GcpuReg::Param(0).offset(), 0xC04);
        assert_eq!(GcpuReg::Param(13).offset(), 0xC38);
        assert_eq!(GcpuReg::Param(14).offset(), 0xC3C);
    }

    #[test]
    fn test_quirk_lookup() {
        assert_eq!(ResetQuirk::for_hw_code(0x8167), ResetQuirk::ClockGate);
        assert_eq!(ResetQuirk::for_hw_code(0x8127), ResetQuirk::ReleaseFirst);
        assert_eq!(ResetQuirk::for_hw_code(0x0335), ResetQuirk::PkInit);
        assert_eq!(ResetQuirk::for_hw_code(0x0766), ResetQuirk::Generic);
    }

    #[tokio::test]
    async fn test_key_material_round_trip() {
        let brom = SimBrom::new(0x0766);
        let base = brom.gcpu_base();
        let mut io = brom.direct_io();
        let mut gcpu = Gcpu::new(CryptoConfig::new(&mut io, 0x0766), base, DEFAULT_SLOTS);

        let material: Vec<u8> = (0u8..16).collect();
        gcpu.set_key_material(KeySlot::Seed, &material).await.unwrap();
        assert_eq!(gcpu.get_key_material(KeySlot::Seed, 16).await.unwrap(), material);

        // Little-endian word layout in the scratch window
        let word = brom.peek(base + 0xC00 + 0x16 * 4);
        assert_eq!(word, 0x0302_0100);

        gcpu.clear_slot(KeySlot::Seed).await.unwrap();
        assert_eq!(gcpu.get_key_material(KeySlot::Seed, 16).await.unwrap(), vec![0; 16]);
    }

    #[tokio::test]
    async fn test_mem_write_requires_bit_13() {
        let brom = SimBrom::new(0x0766);
        let base = brom.gcpu_base();
        let mut io = brom.direct_io();
        let mut gcpu = Gcpu::new(CryptoConfig::new(&mut io, 0x0766), base, DEFAULT_SLOTS);

        let err = gcpu.mem_write(0x1000, &[1]).await.unwrap_err();
        assert!(matches!(err, Error::Crypto(CryptoEngineFault::OperationFailed { .. })));

        gcpu.mem_write(0x2000, &[0xAA, 0xBB]).await.unwrap();
        assert_eq!(gcpu.mem_read(0x2000, 2).await.unwrap(), vec![0xAA, 0xBB]);
        // The write-mode bit went out on the address register
        assert_eq!(brom.gcpu_mem_addr_history().first(), Some(&0x8000_2000));
    }

    #[tokio::test]
    async fn test_dispatch_failure_bit() {
        let brom = SimBrom::new(0x0766);
        brom.fail_opcode(0x78);
        let base = brom.gcpu_base();
        let mut io = brom.direct_io();
        let mut gcpu = Gcpu::new(CryptoConfig::new(&mut io, 0x0766), base, DEFAULT_SLOTS);

        let err = gcpu.aes_ecb(Direction::Decrypt, 0x30, 0x12, 0x1A).await.unwrap_err();
        assert!(matches!(err, Error::Crypto(CryptoEngineFault::OperationFailed { opcode: 0x78 })));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_hung_engine_times_out() {
        let brom = SimBrom::new(0x0766);
        brom.hang_gcpu();
        let base = brom.gcpu_base();
        let mut io = brom.direct_io();
        let poll = PollConfig { timeout: Duration::from_millis(30), interval: Duration::from_millis(1) };
        let config = CryptoConfig::new(&mut io, 0x0766).with_poll(poll);
        let mut gcpu = Gcpu::new(config, base, DEFAULT_SLOTS);

        let err = gcpu.dispatch(0x79, &[0, 0x12, 0x16, 0x1A]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Crypto(CryptoEngineFault::Timeout { what: "GCPU_REG_INT_SET", .. })
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_poll() {
        let brom = SimBrom::new(0x0766);
        brom.hang_gcpu();
        let base = brom.gcpu_base();
        let mut io = brom.direct_io();
        let cancel = CancelToken::new();
        cancel.cancel();
        let config = CryptoConfig::new(&mut io, 0x0766).with_cancel(cancel);
        let mut gcpu = Gcpu::new(config, base, DEFAULT_SLOTS);

        let err = gcpu.dispatch(0x79, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_too_many_operands() {
        let brom = SimBrom::new(0x0766);
        let base = brom.gcpu_base();
        let mut io = brom.direct_io();
        let mut gcpu = Gcpu::new(CryptoConfig::new(&mut io, 0x0766), base, DEFAULT_SLOTS);

        assert!(gcpu.dispatch(0x79, &[0; 15]).await.is_err());
    }

    #[tokio::test]
    async fn test_setup_cbc_writes_chosen_block() {
        let brom = SimBrom::new(0x0766);
        let base = brom.gcpu_base();
        let mut io = brom.direct_io();
        let mut gcpu = Gcpu::new(CryptoConfig::new(&mut io, 0x0766), base, DEFAULT_SLOTS);

        let entry = BlacklistEntry::single(0x0010_2828, 0x1234_5678);
        gcpu.disable_range_blacklist(&[entry]).await.unwrap();

        let written: Vec<u32> = (0..4).map(|i| brom.peek(0x0010_2828 + i * 4)).collect();
        assert_eq!(written, entry.words.to_vec());
    }

    #[tokio::test]
    async fn test_mtee_label_key_is_stable() {
        let brom = SimBrom::new(0x0335);
        let base = brom.gcpu_base();
        let mut io = brom.direct_io();
        let mut gcpu = Gcpu::new(CryptoConfig::new(&mut io, 0x0335), base, DEFAULT_SLOTS);

        let a = gcpu.mtee_label_key().await.unwrap();
        let b = gcpu.mtee_label_key().await.unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
        assert_eq!(a, brom.expected_mtee_label_key());
    }
}
