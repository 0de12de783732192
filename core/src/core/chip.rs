/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::{KeyDerivationUnavailable, Result};

/// Four words written over a range-check table entry to disable it.
pub type BlacklistWords = [u32; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub addr: u32,
    pub words: BlacklistWords,
}

impl BlacklistEntry {
    /// Entry with a single overwrite value, padded the way the BootROM expects.
    pub const fn single(addr: u32, value: u32) -> Self {
        BlacklistEntry { addr, words: [value, 0, 0, 0x80] }
    }
}

/// Indices into the GCPU scratch memory window, in words from `MEM_CMD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTable {
    pub key: u32,
    pub seed: u32,
    pub iv: u32,
    pub hw_key: u32,
}

pub const DEFAULT_SLOTS: SlotTable = SlotTable { key: 0x12, seed: 0x16, iv: 0x1A, hw_key: 0x30 };

/// Seeds and labels of the GCPU FDE, TEE and RPMB2 derivations, and of the SEJ FDE input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLabels {
    pub fde_seed: [u8; 16],
    pub tee_seed: [u8; 16],
    pub rpmb2_label: &'static [u8],
}

/// Not captured from any device. Keys derived from these are only stable, not authentic,
/// until a profile carries the real values.
pub const PLACEHOLDER_LABELS: KeyLabels = KeyLabels {
    fde_seed: *b"MTK_FDE_KEY_SEED",
    tee_seed: *b"MTK_TEE_KEY_SEED",
    rpmb2_label: b"RPMB2\0",
};

/// Offset of the public key hash inside the efuse block.
pub const PUBK_OFFSET: u32 = 0x90;
pub const PUBK_LEN: usize = 0x20;

/// Static per-SoC configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipProfile {
    pub hw_code: u16,
    pub name: &'static str,
    pub watchdog: u32,
    pub brom_payload_addr: u32,
    pub blacklist: &'static [BlacklistEntry],
    pub gcpu_base: Option<u32>,
    pub sej_base: Option<u32>,
    pub meid_addr: Option<u32>,
    pub socid_addr: Option<u32>,
    pub prov_addr: Option<u32>,
    pub efuse_addr: Option<u32>,
    /// Device info words XORed into the GCPU derivation seed.
    pub devinfo_seed_addrs: Option<(u32, u32)>,
    /// Device-family constant accepted by this BootROM, when known.
    pub known_constant: Option<u8>,
    pub slots: SlotTable,
    pub labels: KeyLabels,
}

const WDT: u32 = 0x1000_7000;
const PAYLOAD_ADDR: u32 = 0x0010_0A00;

const BASE: ChipProfile = ChipProfile {
    hw_code: 0,
    name: "",
    watchdog: WDT,
    brom_payload_addr: PAYLOAD_ADDR,
    blacklist: &[],
    gcpu_base: None,
    sej_base: None,
    meid_addr: None,
    socid_addr: None,
    prov_addr: None,
    efuse_addr: None,
    devinfo_seed_addrs: None,
    known_constant: None,
    slots: DEFAULT_SLOTS,
    labels: PLACEHOLDER_LABELS,
};

pub static CHIP_PROFILES: &[ChipProfile] = &[
    ChipProfile {
        hw_code: 0x0279,
        name: "MT6797",
        blacklist: &[
            BlacklistEntry::single(0x0010_2844, 0),
            BlacklistEntry::single(0x0010_6A60, 0),
        ],
        gcpu_base: Some(0x1021_0000),
        sej_base: Some(0x1000_A000),
        meid_addr: Some(0x0010_2AF8),
        efuse_addr: Some(0x1020_6000),
        known_constant: Some(0x0A),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x0321,
        name: "MT6735",
        blacklist: &[
            BlacklistEntry::single(0x0010_2760, 0),
            BlacklistEntry::single(0x0010_5704, 0),
        ],
        gcpu_base: Some(0x1021_0000),
        sej_base: Some(0x1000_A000),
        meid_addr: Some(0x0010_2B78),
        efuse_addr: Some(0x1020_6000),
        known_constant: Some(0x28),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x0335,
        name: "MT6737M",
        blacklist: &[
            BlacklistEntry::single(0x0010_2760, 0),
            BlacklistEntry::single(0x0010_5704, 0),
        ],
        gcpu_base: Some(0x1021_0000),
        sej_base: Some(0x1000_A000),
        meid_addr: Some(0x0010_2B78),
        efuse_addr: Some(0x1020_6000),
        known_constant: Some(0x28),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x0699,
        name: "MT6739",
        blacklist: &[
            BlacklistEntry::single(0x0010_2A80, 0),
            BlacklistEntry::single(0x0010_5FB0, 0),
        ],
        gcpu_base: Some(0x1005_0000),
        sej_base: Some(0x1000_A000),
        meid_addr: Some(0x0010_2B98),
        socid_addr: Some(0x0010_2BA8),
        efuse_addr: Some(0x11F1_0000),
        known_constant: Some(0xB4),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x0766,
        name: "MT6765",
        blacklist: &[
            BlacklistEntry::single(0x0010_2828, 0),
            BlacklistEntry::single(0x0010_5418, 0),
        ],
        gcpu_base: Some(0x1005_0000),
        sej_base: Some(0x1000_A000),
        meid_addr: Some(0x0010_2AF8),
        socid_addr: Some(0x0010_2B08),
        prov_addr: Some(0x0010_2F80),
        efuse_addr: Some(0x11C5_0000),
        known_constant: Some(0x25),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x8163,
        name: "MT8163",
        blacklist: &[
            BlacklistEntry::single(0x0010_2968, 0),
            BlacklistEntry::single(0x0010_7954, 0),
        ],
        gcpu_base: Some(0x1021_0000),
        sej_base: Some(0x1000_A000),
        efuse_addr: Some(0x1020_6000),
        known_constant: Some(0xB1),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x8167,
        name: "MT8167",
        blacklist: &[
            BlacklistEntry::single(0x0010_2968, 0),
            BlacklistEntry::single(0x0010_7954, 0),
        ],
        gcpu_base: Some(0x1020_D000),
        sej_base: Some(0x1000_A000),
        meid_addr: Some(0x0010_3478),
        efuse_addr: Some(0x1000_9000),
        known_constant: Some(0xCC),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x8172,
        name: "MT8173",
        brom_payload_addr: 0x0012_0A00,
        blacklist: &[BlacklistEntry::single(0x0012_2774, 0)],
        gcpu_base: Some(0x1021_6000),
        sej_base: Some(0x1000_8000),
        devinfo_seed_addrs: Some((0x1020_6140, 0x1020_6144)),
        efuse_addr: Some(0x1020_6000),
        known_constant: Some(0x0A),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x8176,
        name: "MT8176",
        brom_payload_addr: 0x0012_0A00,
        blacklist: &[BlacklistEntry::single(0x0012_2774, 0)],
        gcpu_base: Some(0x1021_6000),
        sej_base: Some(0x1000_8000),
        efuse_addr: Some(0x1020_6000),
        known_constant: Some(0x0A),
        ..BASE
    },
    ChipProfile {
        hw_code: 0x6572,
        name: "MT6572",
        watchdog: 0x1000_0000,
        brom_payload_addr: 0x0010_A000,
        blacklist: &[BlacklistEntry::single(0x0010_2504, 0)],
        sej_base: Some(0x1100_0000),
        efuse_addr: Some(0x1000_9000),
        known_constant: Some(0x60),
        ..BASE
    },
];

/// Base of the legacy id block, used when a profile carries no explicit id addresses.
fn legacy_id_base(hw_code: u16) -> u32 {
    match hw_code {
        0x2601 | 0x6572 => 0x1114_1000,
        0x6261 => 0x7000_0000,
        0x8172 | 0x8176 => 0x0012_2000,
        _ => 0x0010_0000,
    }
}

impl ChipProfile {
    pub fn from_hw_code(hw_code: u16) -> Option<&'static ChipProfile> {
        CHIP_PROFILES.iter().find(|p| p.hw_code == hw_code)
    }

    fn missing(&self, field: &'static str) -> KeyDerivationUnavailable {
        KeyDerivationUnavailable::MissingProfileField { hw_code: self.hw_code, field }
    }

    pub fn require_gcpu(&self) -> Result<u32> {
        self.gcpu_base.ok_or_else(|| self.missing("gcpu_base").into())
    }

    pub fn require_sej(&self) -> Result<u32> {
        self.sej_base.ok_or_else(|| self.missing("sej_base").into())
    }

    pub fn require_prov(&self) -> Result<u32> {
        self.prov_addr.ok_or_else(|| self.missing("prov_addr").into())
    }

    pub fn require_efuse(&self) -> Result<u32> {
        self.efuse_addr.ok_or_else(|| self.missing("efuse_addr").into())
    }

    pub fn meid_addr(&self) -> u32 {
        self.meid_addr.unwrap_or(legacy_id_base(self.hw_code) + 0x8EC)
    }

    pub fn socid_addr(&self) -> u32 {
        self.socid_addr.unwrap_or(legacy_id_base(self.hw_code) + 0x934)
    }

    pub fn has_crypto_engine(&self) -> bool {
        self.gcpu_base.is_some() || self.sej_base.is_some()
    }
}
