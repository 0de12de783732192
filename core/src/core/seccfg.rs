/*
    SPDX-License-Identifier: GPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy

    Derived from:
    https://github.com/bkerler/mtkclient/blob/main/mtkclient/Library/Hardware/seccfg.py
    Original SPDX-License-Identifier: GPL-3.0-or-later
    Original SPDX-FileCopyrightText: 2018–2024 bkerler

    This file remains under the GPL-3.0-or-later license.
    However, as part of a larger project licensed under the AGPL-3.0-or-later,
    the combined work is subject to the networking terms of the AGPL-3.0-or-later,
    as for term 13 of the GPL-3.0-or-later license.
*/
use aes::Aes128;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::core::crypto::sej::{HACC_CFG_1, Sej};
use crate::error::{Error, Result};

const V4_MAGIC_BEGIN: u32 = 0x4D4D4D4D;
const V4_MAGIC_END: u32 = 0x45454545;
const HEADER_LEN: usize = 28;
const HASH_LEN: usize = 32;
const SECCFG_BLOCK: usize = 0x200;

const SW_KEY: [u8; 16] = [
    0x25, 0xA1, 0x76, 0x3A, 0x21, 0xBC, 0x85, 0x4C, 0xD5, 0x69, 0xDC, 0x23, 0xB4, 0x78, 0x2B, 0x63,
];
const SW_IV: [u8; 16] = [
    0x57, 0x32, 0x5A, 0x5A, 0x12, 0x54, 0x97, 0x66, 0x12, 0x54, 0x97, 0x66, 0x57, 0x32, 0x5A, 0x5A,
];

/// Raw flash access for reading and rewriting the seccfg partition.
#[async_trait::async_trait]
pub trait FlashIo: Send {
    async fn read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;
    /// Returns whether the device accepted the write.
    async fn write(&mut self, addr: u64, data: &[u8]) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFlag {
    Lock,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecCfgV4Algo {
    Sw,
    Hw,
    HwLegacy,
}

impl SecCfgV4Algo {
    const ALL: [SecCfgV4Algo; 3] = [SecCfgV4Algo::Sw, SecCfgV4Algo::Hw, SecCfgV4Algo::HwLegacy];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecCfgV4 {
    pub seccfg_ver: u32,
    pub seccfg_size: u32,
    pub lock_state: u32,
    pub critical_lock_state: u32,
    pub sboot_runtime: u32,
    algo: Option<SecCfgV4Algo>,
    enc_hash: Vec<u8>,
}

impl Default for SecCfgV4 {
    fn default() -> Self {
        SecCfgV4 {
            seccfg_ver: 4,
            seccfg_size: 0x3C,
            lock_state: 1,
            critical_lock_state: 0,
            sboot_runtime: 0,
            algo: None,
            enc_hash: Vec::new(),
        }
    }
}

fn le32(data: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn sw_crypt(data: &[u8], encrypt: bool) -> Result<Vec<u8>> {
    let mut buf = data.to_vec();
    let len = buf.len();
    let err = |_| Error::umbra("Seccfg hash is not block aligned");

    if encrypt {
        cbc::Encryptor::<Aes128>::new(&SW_KEY.into(), &SW_IV.into())
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(err)?;
    } else {
        cbc::Decryptor::<Aes128>::new(&SW_KEY.into(), &SW_IV.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| Error::umbra("Seccfg hash is not block aligned"))?;
    }
    Ok(buf)
}

async fn crypt(algo: SecCfgV4Algo, sej: &mut Sej<'_>, data: &[u8], encrypt: bool) -> Result<Vec<u8>> {
    match algo {
        SecCfgV4Algo::Sw => sw_crypt(data, encrypt),
        SecCfgV4Algo::Hw => sej.aes128_cbc(data, encrypt, &HACC_CFG_1, false).await,
        SecCfgV4Algo::HwLegacy => sej.aes128_cbc(data, encrypt, &HACC_CFG_1, true).await,
    }
}

impl SecCfgV4 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_header(data: &[u8]) -> Result<SecCfgV4> {
        if data.len() < HEADER_LEN + HASH_LEN {
            return Err(Error::umbra("SecCfg v4 data too short"));
        }

        let magic = le32(data, 0);
        let endflag = le32(data, 24);
        if magic != V4_MAGIC_BEGIN || endflag != V4_MAGIC_END {
            return Err(Error::umbra("Invalid SecCfg v4 magic values"));
        }

        Ok(SecCfgV4 {
            seccfg_ver: le32(data, 4),
            seccfg_size: le32(data, 8),
            lock_state: le32(data, 12),
            critical_lock_state: le32(data, 16),
            sboot_runtime: le32(data, 20),
            algo: None,
            enc_hash: data[HEADER_LEN..HEADER_LEN + HASH_LEN].to_vec(),
        })
    }

    /// Parses the header and finds which algorithm sealed its hash.
    pub async fn parse(data: &[u8], sej: &mut Sej<'_>) -> Result<SecCfgV4> {
        let mut seccfg = Self::parse_header(data)?;
        let hash = seccfg.hash();

        for algo in SecCfgV4Algo::ALL {
            let dec = crypt(algo, sej, &seccfg.enc_hash, false).await?;
            if dec == hash {
                debug!("Seccfg hash sealed with {:?}", algo);
                seccfg.algo = Some(algo);
                return Ok(seccfg);
            }
        }

        Err(Error::umbra("Unknown seccfg encryption, cannot verify hash"))
    }

    fn header(&self) -> Vec<u8> {
        [
            V4_MAGIC_BEGIN,
            self.seccfg_ver,
            self.seccfg_size,
            self.lock_state,
            self.critical_lock_state,
            self.sboot_runtime,
            V4_MAGIC_END,
        ]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
    }

    pub fn hash(&self) -> Vec<u8> {
        Sha256::digest(self.header()).to_vec()
    }

    pub fn algo(&self) -> Option<SecCfgV4Algo> {
        self.algo
    }

    pub fn set_algo(&mut self, algo: SecCfgV4Algo) {
        self.algo = Some(algo);
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state != 3
    }

    pub fn set_lock_state(&mut self, lock_flag: LockFlag) {
        match lock_flag {
            LockFlag::Lock => {
                self.lock_state = 4;
                self.critical_lock_state = 1;
            }
            LockFlag::Unlock => {
                self.lock_state = 3;
                self.critical_lock_state = 0;
            }
        }
    }

    /// Serializes with a freshly sealed hash, padded to a full block.
    pub async fn create(&mut self, sej: &mut Sej<'_>) -> Result<Vec<u8>> {
        let algo = self.algo.ok_or_else(|| Error::umbra("Seccfg algorithm not set"))?;
        self.enc_hash = crypt(algo, sej, &self.hash(), true).await?;

        let mut data = self.header();
        data.extend_from_slice(&self.enc_hash);
        data.resize(data.len().next_multiple_of(SECCFG_BLOCK), 0);
        Ok(data)
    }
}

/// Reads the lock state from the seccfg block at `addr`.
pub async fn read_lock_state(flash: &mut dyn FlashIo, addr: u64, sej: &mut Sej<'_>) -> Result<SecCfgV4> {
    let raw = flash.read(addr, SECCFG_BLOCK).await?;
    SecCfgV4::parse(&raw, sej).await
}

/// Rewrites the seccfg block at `addr` with the new lock state.
pub async fn write_lock_state(
    flash: &mut dyn FlashIo,
    addr: u64,
    sej: &mut Sej<'_>,
    flag: LockFlag,
) -> Result<SecCfgV4> {
    let mut seccfg = read_lock_state(flash, addr, sej).await?;
    seccfg.set_lock_state(flag);
    let data = seccfg.create(sej).await?;

    if !flash.write(addr, &data).await? {
        return Err(Error::umbra("Flash rejected the seccfg write"));
    }

    info!("Seccfg lock state set to {:?}", flag);
    Ok(seccfg)
}
