/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;

use hmac::{Hmac, Mac};
use log::{info, warn};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::core::chip::ChipProfile;
use crate::core::crypto::config::{CryptoConfig, CryptoIO, PollConfig};
use crate::core::crypto::gcpu::{Gcpu, MTEE_LABEL};
use crate::core::crypto::sej::{HACC_CFG_1, HACC_CFG_MTEE, Sej};
use crate::error::{Error, KeyDerivationUnavailable, Result};
use crate::utilities::CancelToken;
use crate::utilities::bytes::{expand, find_bytes, xor_in_place};

type HmacSha256 = Hmac<Sha256>;

pub const RPMB_SEED: [u8; 16] = [
    0x73, 0x5F, 0x23, 0xC9, 0x62, 0xE7, 0xA1, 0x0A, 0xB2, 0x01, 0xD9, 0xA6, 0x42, 0x60, 0x64, 0xB1,
];

const TEE_SEJ_LABEL: &[u8; 16] = b"KeymasterMaster\0";

/// Chips whose TEE key is the GCPU label key instead of a SEJ derivation.
const MTEE_LABEL_CHIPS: [u16; 4] = [0x0335, 0x8167, 0x8163, 0x8176];

const OTP_MAGIC: [u8; 5] = [0x4D, 0x4D, 0x4D, 0x01, 0x30];
const OTP_OFFSET: usize = 0xC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    RpmbKey,
    RpmbKey2,
    FdeKey,
    TeeKey,
    ProvisioningKey,
    Mtee3Key,
}

impl KeyKind {
    pub const ALL: [KeyKind; 6] = [
        KeyKind::RpmbKey,
        KeyKind::RpmbKey2,
        KeyKind::FdeKey,
        KeyKind::TeeKey,
        KeyKind::ProvisioningKey,
        KeyKind::Mtee3Key,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KeyKind::RpmbKey => "rpmb",
            KeyKind::RpmbKey2 => "rpmb2",
            KeyKind::FdeKey => "fde",
            KeyKind::TeeKey => "tee",
            KeyKind::ProvisioningKey => "prov",
            KeyKind::Mtee3Key => "mtee3",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationPath {
    Gcpu,
    Sej,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub hw_code: u16,
    pub path: DerivationPath,
}

/// A derived key. The bytes are wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeyMaterial {
    #[zeroize(skip)]
    kind: KeyKind,
    data: Vec<u8>,
    #[zeroize(skip)]
    provenance: Provenance,
}

impl DerivedKeyMaterial {
    fn new(kind: KeyKind, data: Vec<u8>, provenance: Provenance) -> Self {
        Self { kind, data, provenance }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl fmt::Debug for DerivedKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeyMaterial")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("provenance", &self.provenance)
            .finish()
    }
}

/// Identifiers read from the BootROM id block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIds {
    pub meid: Vec<u8>,
    pub socid: Vec<u8>,
}

/// Result of a full key run: ids, the efuse public key hash when readable, and the keys.
#[derive(Debug, Clone, Default)]
pub struct KeyReport {
    pub ids: DeviceIds,
    pub pubk: Option<Vec<u8>>,
    pub keys: Vec<DerivedKeyMaterial>,
}

#[derive(Debug, Clone)]
pub struct DeriveRequest {
    /// eMMC CID, required for the GCPU RPMB keys.
    pub cid: Option<[u8; 16]>,
    /// Software OTP for SEJ, usually taken from the preloader. Zeroes when absent.
    pub otp: Option<[u8; 32]>,
    pub kinds: Vec<KeyKind>,
}

impl Default for DeriveRequest {
    fn default() -> Self {
        Self { cid: None, otp: None, kinds: KeyKind::ALL.to_vec() }
    }
}

impl DeriveRequest {
    pub fn with_cid(mut self, cid: [u8; 16]) -> Self {
        self.cid = Some(cid);
        self
    }

    pub fn with_otp(mut self, otp: [u8; 32]) -> Self {
        self.otp = Some(otp);
        self
    }

    pub fn with_kinds(mut self, kinds: &[KeyKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }
}

/// Finds the software OTP the preloader embeds after its `MMM\x01\x30` header.
pub fn otp_from_preloader(preloader: &[u8]) -> Option<[u8; 32]> {
    let start = find_bytes(preloader, &OTP_MAGIC)? + OTP_OFFSET;
    preloader.get(start..start + 32)?.try_into().ok()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::umbra("Invalid HMAC key"))?;
    mac.update(data);
    Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
}

/// Per-key GCPU derivation inputs.
struct GcpuRecipe {
    seed: [u8; 16],
    data: Vec<u8>,
    label: &'static [u8],
    reverse: bool,
}

fn no_path(what: impl Into<String>) -> Error {
    KeyDerivationUnavailable::NoHardwarePath { what: what.into() }.into()
}

/// Chooses the engine for `kind`, without touching the device.
pub fn plan(
    profile: &ChipProfile,
    ids: &DeviceIds,
    request: &DeriveRequest,
    kind: KeyKind,
) -> Result<DerivationPath> {
    let gcpu = profile.gcpu_base.is_some();
    let sej = profile.sej_base.is_some();

    let path = match kind {
        KeyKind::RpmbKey if sej && !ids.meid.is_empty() => DerivationPath::Sej,
        KeyKind::RpmbKey2 if sej && !ids.socid.is_empty() => DerivationPath::Sej,
        KeyKind::RpmbKey | KeyKind::RpmbKey2 if gcpu && request.cid.is_some() => {
            DerivationPath::Gcpu
        }
        KeyKind::RpmbKey | KeyKind::RpmbKey2 => {
            return Err(no_path(format!("{}: no SEJ id and no eMMC CID", kind)));
        }
        KeyKind::FdeKey if sej => DerivationPath::Sej,
        KeyKind::TeeKey if gcpu && MTEE_LABEL_CHIPS.contains(&profile.hw_code) => {
            DerivationPath::Gcpu
        }
        KeyKind::TeeKey if sej => DerivationPath::Sej,
        KeyKind::FdeKey | KeyKind::TeeKey if gcpu && !ids.meid.is_empty() => DerivationPath::Gcpu,
        KeyKind::Mtee3Key if sej => DerivationPath::Sej,
        KeyKind::ProvisioningKey => {
            profile.require_prov()?;
            DerivationPath::Memory
        }
        _ => return Err(no_path(format!("{} on {}", kind, profile.name))),
    };
    Ok(path)
}

/// Runs the derivation sequences for one chip over register access.
pub struct KeyPipeline<'a> {
    io: &'a mut dyn CryptoIO,
    profile: &'a ChipProfile,
    ids: &'a DeviceIds,
    poll: PollConfig,
    cancel: CancelToken,
}

impl<'a> KeyPipeline<'a> {
    pub fn new(io: &'a mut dyn CryptoIO, profile: &'a ChipProfile, ids: &'a DeviceIds) -> Self {
        Self { io, profile, ids, poll: PollConfig::default(), cancel: CancelToken::new() }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn config(&mut self) -> CryptoConfig<'_> {
        CryptoConfig::new(&mut *self.io, self.profile.hw_code)
            .with_poll(self.poll.clone())
            .with_cancel(self.cancel.clone())
    }

    /// Derives every requested key. Non-fatal failures skip the key, fatal ones are returned.
    pub async fn derive_all(&mut self, request: &DeriveRequest) -> Result<Vec<DerivedKeyMaterial>> {
        let mut keys = Vec::with_capacity(request.kinds.len());

        for &kind in &request.kinds {
            self.cancel.check()?;

            let path = match plan(self.profile, self.ids, request, kind) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping {} key: {}", kind, e);
                    continue;
                }
            };

            match self.derive(kind, path, request).await {
                Ok(key) => {
                    info!("Derived {} key via {:?}", kind, path);
                    keys.push(key);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Skipping {} key: {}", kind, e),
            }
        }

        Ok(keys)
    }

    pub async fn derive(
        &mut self,
        kind: KeyKind,
        path: DerivationPath,
        request: &DeriveRequest,
    ) -> Result<DerivedKeyMaterial> {
        let data = match path {
            DerivationPath::Memory => self.read_prov_key().await?,
            DerivationPath::Sej => self.derive_sej(kind, request).await?,
            DerivationPath::Gcpu if kind == KeyKind::TeeKey
                && MTEE_LABEL_CHIPS.contains(&self.profile.hw_code) =>
            {
                let base = self.profile.require_gcpu()?;
                let slots = self.profile.slots;
                Gcpu::new(self.config(), base, slots).mtee_label_key().await?
            }
            DerivationPath::Gcpu => {
                let recipe = self.gcpu_recipe(kind, request)?;
                self.derive_gcpu(&recipe).await?
            }
        };

        let provenance = Provenance { hw_code: self.profile.hw_code, path };
        Ok(DerivedKeyMaterial::new(kind, data, provenance))
    }

    async fn read_prov_key(&mut self) -> Result<Vec<u8>> {
        let addr = self.profile.require_prov()?;
        let words = self.io.read_words(addr, 4).await?;
        Ok(crate::utilities::bytes::from_words(&words))
    }

    async fn derive_sej(&mut self, kind: KeyKind, request: &DeriveRequest) -> Result<Vec<u8>> {
        let base = self.profile.require_sej()?;
        let otp = Zeroizing::new(request.otp.unwrap_or([0; 32]));
        let ids = self.ids;
        let profile = self.profile;

        let mut sej = Sej::new(self.config(), base);
        sej.set_otp(&otp).await?;

        match kind {
            KeyKind::RpmbKey => sej.aes128_cbc(&expand(&ids.meid, 32), true, &HACC_CFG_1, false).await,
            KeyKind::RpmbKey2 => {
                sej.aes128_cbc(&expand(&ids.socid, 32), true, &HACC_CFG_1, false).await
            }
            KeyKind::FdeKey => {
                let seed = profile.labels.fde_seed;
                sej.aes128_cbc(&expand(&seed, 32), true, &HACC_CFG_1, false).await
            }
            KeyKind::TeeKey => sej.aes128_cbc(TEE_SEJ_LABEL, true, &HACC_CFG_MTEE, false).await,
            KeyKind::Mtee3Key => sej.aes128_cbc(MTEE_LABEL, true, &HACC_CFG_MTEE, true).await,
            KeyKind::ProvisioningKey => Err(no_path("prov over SEJ")),
        }
    }

    fn gcpu_recipe(&self, kind: KeyKind, request: &DeriveRequest) -> Result<GcpuRecipe> {
        let cid = || request.cid.ok_or_else(|| no_path(format!("{}: no eMMC CID", kind)));

        let recipe = match kind {
            KeyKind::RpmbKey => GcpuRecipe {
                seed: RPMB_SEED,
                data: expand(&cid()?, 64),
                label: b"RPMB\0",
                reverse: true,
            },
            KeyKind::RpmbKey2 => GcpuRecipe {
                seed: RPMB_SEED,
                data: expand(&cid()?, 64),
                label: self.profile.labels.rpmb2_label,
                reverse: true,
            },
            KeyKind::FdeKey => GcpuRecipe {
                seed: self.profile.labels.fde_seed,
                data: expand(&self.ids.meid, 64),
                label: b"FDE\0",
                reverse: false,
            },
            KeyKind::TeeKey => GcpuRecipe {
                seed: self.profile.labels.tee_seed,
                data: expand(&self.ids.meid, 64),
                label: b"TEE\0",
                reverse: false,
            },
            _ => return Err(no_path(format!("{} over GCPU", kind))),
        };
        Ok(recipe)
    }

    /// `HMAC(HMAC(scrambled(seed ^ devinfo), data), label)`.
    async fn derive_gcpu(&mut self, recipe: &GcpuRecipe) -> Result<Vec<u8>> {
        let base = self.profile.require_gcpu()?;
        let slots = self.profile.slots;

        let mut seed = Zeroizing::new(recipe.seed);
        if let Some((lo, hi)) = self.profile.devinfo_seed_addrs {
            let lo = self.io.read32(lo).await?;
            let hi = self.io.read32(hi).await?;
            xor_in_place(&mut seed[0..4], &lo.to_le_bytes());
            xor_in_place(&mut seed[4..8], &hi.to_le_bytes());
        }

        let scrambled = Zeroizing::new(Gcpu::new(self.config(), base, slots).scrambled_key(&seed).await?);

        let k = hmac_sha256(&scrambled[..], &recipe.data)?;
        let mut key = hmac_sha256(&k[..32], recipe.label)?;
        if recipe.reverse {
            key.reverse();
        }
        Ok(key.to_vec())
    }
}
