/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, error, info, warn};

use crate::connection::port::{MTKPort, find_mtk_port};
use crate::connection::{Channel, ChannelConfig, Connection, LinkState};
use crate::core::chip::{ChipProfile, PUBK_LEN, PUBK_OFFSET};
use crate::core::crypto::config::{CryptoConfig, CryptoIO, PollConfig};
use crate::core::crypto::gcpu::Gcpu;
use crate::core::crypto::sej::Sej;
use crate::core::keys::{DeriveRequest, DerivedKeyMaterial, DeviceIds, KeyPipeline, KeyReport};
use crate::core::seccfg::{self, FlashIo, LockFlag, SecCfgV4};
use crate::error::{Error, KeyDerivationUnavailable, Result};
use crate::exploit::{
    BruteForceEvent,
    ConstantStore,
    DeviceConnector,
    ExploitOptions,
    ExploitOutcome,
    Kamakiri,
    MemoryConstantStore,
    PortConnector,
};
use crate::utilities::CancelToken;
use crate::utilities::bytes::from_words;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionMode {
    Disconnected,
    Connected,
    Exploited,
    RegistersAccessible,
}

/// A builder for a [`Session`].
///
/// Everything is optional: without a port the first detected MediaTek device is used,
/// without a connector reconnects go through port detection, and discovered constants
/// are only kept in memory. Serial links stay at the handshake rate unless
/// [`SessionBuilder::escalate_baud`] is set.
///
/// # Example
/// ```ignore
/// use umbra::SessionBuilder;
///
/// let mut session = SessionBuilder::default().with_poll_config(poll).connect().await?;
/// ```
#[derive(Default)]
pub struct SessionBuilder {
    port: Option<Box<dyn MTKPort>>,
    channel_config: Option<ChannelConfig>,
    profile: Option<&'static ChipProfile>,
    connector: Option<Box<dyn DeviceConnector>>,
    store: Option<Box<dyn ConstantStore>>,
    cancel: Option<CancelToken>,
    poll: Option<PollConfig>,
    exploit_options: Option<ExploitOptions>,
    escalate_baud: bool,
}

impl SessionBuilder {
    pub fn with_port(mut self, port: Box<dyn MTKPort>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = Some(config);
        self
    }

    /// Overrides the profile looked up from the hardware code.
    pub fn with_profile(mut self, profile: &'static ChipProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_connector(mut self, connector: Box<dyn DeviceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_store(mut self, store: Box<dyn ConstantStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = Some(poll);
        self
    }

    pub fn with_exploit_options(mut self, options: ExploitOptions) -> Self {
        self.exploit_options = Some(options);
        self
    }

    /// Switches serial links to the escalated rate after the handshake.
    pub fn escalate_baud(mut self, on: bool) -> Self {
        self.escalate_baud = on;
        self
    }

    /// Opens the port, handshakes and identifies the chip.
    pub async fn connect(self) -> Result<Session> {
        let port = match self.port {
            Some(port) => port,
            None => find_mtk_port().await.ok_or_else(|| Error::conn("No MediaTek device found"))?,
        };

        let cancel = self.cancel.unwrap_or_default();
        let channel = Channel::new(port)
            .with_config(self.channel_config.unwrap_or_default())
            .with_cancel(cancel.clone());

        let mut conn = Connection::from_channel(channel);
        conn.connect().await?;
        if self.escalate_baud {
            conn.escalate_baud().await?;
        }

        let hw_code = conn.get_hw_code().await?;
        match conn.get_target_config().await {
            Ok(cfg) => info!(
                "Target config 0x{:08X} (SBC: {}, SLA: {}, DAA: {})",
                cfg,
                cfg & 1 != 0,
                cfg & 2 != 0,
                cfg & 4 != 0
            ),
            Err(e) => debug!("Target config unavailable: {}", e),
        }

        let profile = self.profile.or_else(|| ChipProfile::from_hw_code(hw_code));
        match profile {
            Some(p) => info!("Connected to {} (0x{:04X})", p.name, hw_code),
            None => warn!("Connected to unknown chip 0x{:04X}", hw_code),
        }

        Ok(Session {
            conn,
            mode: SessionMode::Connected,
            hw_code,
            profile,
            constant: None,
            last_error: None,
            ids: None,
            connector: self.connector.unwrap_or_else(|| Box::new(PortConnector::default())),
            store: self.store.unwrap_or_else(|| Box::new(MemoryConstantStore::new())),
            cancel,
            poll: self.poll.unwrap_or_default(),
            exploit_options: self.exploit_options.unwrap_or_default(),
        })
    }
}

/// Connects to the first detected device with default settings.
pub async fn connect() -> Result<Session> {
    SessionBuilder::default().connect().await
}

/// An open BootROM session.
///
/// # Lifecycle
/// 1. [`connect`] or [`SessionBuilder::connect`] handshakes and identifies the chip.
/// 2. [`Session::exploit`] takes over the BootROM, giving register access.
/// 3. [`Session::derive_keys`] drives the crypto engines, [`Session::generate_keys`] adds
///    the ids and the efuse public key hash.
pub struct Session {
    conn: Connection,
    mode: SessionMode,
    hw_code: u16,
    profile: Option<&'static ChipProfile>,
    constant: Option<u8>,
    last_error: Option<String>,
    ids: Option<DeviceIds>,
    connector: Box<dyn DeviceConnector>,
    store: Box<dyn ConstantStore>,
    cancel: CancelToken,
    poll: PollConfig,
    exploit_options: ExploitOptions,
}

impl Session {
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn hw_code(&self) -> u16 {
        self.hw_code
    }

    pub fn profile(&self) -> Option<&'static ChipProfile> {
        self.profile
    }

    pub fn constant(&self) -> Option<u8> {
        self.constant
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn require_profile(&self) -> Result<&'static ChipProfile> {
        self.profile
            .ok_or_else(|| Error::umbra(format!("No chip profile for hw code 0x{:04X}", self.hw_code)))
    }

    fn require_exploited(&self, op: &str) -> Result<()> {
        if self.mode < SessionMode::Exploited {
            return Err(Error::umbra(format!("{} needs an exploited session", op)));
        }
        Ok(())
    }

    /// Records a failure, closing the session when it left the device in an unknown state.
    async fn fail(&mut self, err: Error) -> Error {
        self.last_error = Some(err.to_string());
        if err.is_fatal() {
            error!("{}, closing session", err);
            self.close().await;
        }
        err
    }

    /// Register access through the link.
    ///
    /// # Panics
    /// When the BootROM has not been exploited yet. Reading protected registers before that
    /// point hangs the device.
    pub fn registers(&mut self) -> RegisterAccess<'_> {
        assert!(
            self.mode >= SessionMode::Exploited,
            "register access requires an exploited session (mode is {:?})",
            self.mode
        );
        RegisterAccess { conn: &mut self.conn }
    }

    /// Runs the watchdog overwrite, brute-forcing the device-family constant.
    pub async fn exploit<F>(&mut self, payload: &[u8], on_event: F) -> Result<ExploitOutcome>
    where
        F: FnMut(BruteForceEvent),
    {
        if self.mode == SessionMode::Disconnected {
            return Err(Error::conn("Session is closed"));
        }
        let profile = self.require_profile()?;

        let kamakiri = Kamakiri::new(profile, payload)
            .with_options(self.exploit_options.clone())
            .with_cancel(self.cancel.clone());

        let result = kamakiri
            .run(
                &mut self.conn,
                self.hw_code,
                profile.known_constant,
                self.connector.as_mut(),
                self.store.as_mut(),
                on_event,
            )
            .await;

        match result {
            Ok(outcome) => {
                self.mode = SessionMode::Exploited;
                self.constant = Some(outcome.constant);
                self.ids = None;
                Ok(outcome)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Disables the BootROM range blacklist through the GCPU.
    pub async fn unlock_registers(&mut self) -> Result<()> {
        self.require_exploited("unlock_registers")?;
        if self.mode == SessionMode::RegistersAccessible {
            return Ok(());
        }

        let profile = self.require_profile()?;
        let base = profile.require_gcpu()?;
        let (poll, cancel) = (self.poll.clone(), self.cancel.clone());

        let result = {
            let mut io = self.registers();
            let config = CryptoConfig::new(&mut io, profile.hw_code).with_poll(poll).with_cancel(cancel);
            let mut gcpu = Gcpu::new(config, base, profile.slots);
            match gcpu.acquire().await {
                Ok(()) => gcpu.disable_range_blacklist(profile.blacklist).await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.mode = SessionMode::RegistersAccessible;
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// MEID and SOCID from the id block, read once per exploited session.
    pub async fn device_ids(&mut self) -> Result<DeviceIds> {
        if let Some(ids) = &self.ids {
            return Ok(ids.clone());
        }
        self.require_exploited("device_ids")?;
        let profile = self.require_profile()?;

        let mut io = self.registers();
        let meid = match io.read_words(profile.meid_addr(), 4).await {
            Ok(words) => from_words(&words),
            Err(e) if !e.is_fatal() => {
                warn!("MEID unreadable: {}", e);
                Vec::new()
            }
            Err(e) => return Err(self.fail(e).await),
        };

        let mut io = self.registers();
        let socid = match io.read_words(profile.socid_addr(), 8).await {
            Ok(words) => from_words(&words),
            Err(e) if !e.is_fatal() => {
                warn!("SOCID unreadable: {}", e);
                Vec::new()
            }
            Err(e) => return Err(self.fail(e).await),
        };

        let ids = DeviceIds { meid, socid };
        self.ids = Some(ids.clone());
        Ok(ids)
    }

    /// Derives the requested keys. Keys without a usable engine are skipped.
    pub async fn derive_keys(&mut self, request: &DeriveRequest) -> Result<Vec<DerivedKeyMaterial>> {
        let profile = self.require_profile()?;
        if !profile.has_crypto_engine() && profile.prov_addr.is_none() {
            return Err(KeyDerivationUnavailable::NoHardwarePath { what: profile.name.to_string() }.into());
        }
        self.require_exploited("derive_keys")?;

        if self.mode == SessionMode::Exploited && profile.gcpu_base.is_some() {
            if let Err(e) = self.unlock_registers().await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Range blacklist still active: {}", e);
            }
        }

        let ids = self.device_ids().await?;
        let (poll, cancel) = (self.poll.clone(), self.cancel.clone());

        let result = {
            let mut io = self.registers();
            KeyPipeline::new(&mut io, profile, &ids)
                .with_poll(poll)
                .with_cancel(cancel)
                .derive_all(request)
                .await
        };

        match result {
            Ok(keys) => Ok(keys),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Public key hash burnt into the efuse block.
    pub async fn read_pubk(&mut self) -> Result<Vec<u8>> {
        self.require_exploited("read_pubk")?;
        let profile = self.require_profile()?;
        let addr = profile.require_efuse()? + PUBK_OFFSET;

        let result = self.registers().read_words(addr, PUBK_LEN / 4).await;
        match result {
            Ok(words) => Ok(from_words(&words)),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Derives the requested keys and collects the ids and public key hash next to them.
    /// A missing or unreadable efuse block leaves `pubk` empty.
    pub async fn generate_keys(&mut self, request: &DeriveRequest) -> Result<KeyReport> {
        let keys = self.derive_keys(request).await?;
        let ids = self.device_ids().await?;

        let pubk = match self.read_pubk().await {
            Ok(pubk) => Some(pubk),
            Err(e) if !e.is_fatal() => {
                warn!("Public key hash unavailable: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        Ok(KeyReport { ids, pubk, keys })
    }

    /// Reads and verifies the seccfg block at `addr`.
    pub async fn seccfg_lock_state(&mut self, flash: &mut dyn FlashIo, addr: u64) -> Result<SecCfgV4> {
        self.require_exploited("seccfg_lock_state")?;
        let profile = self.require_profile()?;
        let base = profile.require_sej()?;
        let (poll, cancel) = (self.poll.clone(), self.cancel.clone());

        let result = {
            let mut io = self.registers();
            let config = CryptoConfig::new(&mut io, profile.hw_code).with_poll(poll).with_cancel(cancel);
            let mut sej = Sej::new(config, base);
            seccfg::read_lock_state(flash, addr, &mut sej).await
        };

        match result {
            Ok(seccfg) => Ok(seccfg),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Rewrites the seccfg block at `addr` with a new lock state.
    pub async fn set_seccfg_lock_state(
        &mut self,
        flash: &mut dyn FlashIo,
        addr: u64,
        flag: LockFlag,
    ) -> Result<SecCfgV4> {
        self.require_exploited("set_seccfg_lock_state")?;
        let profile = self.require_profile()?;
        let base = profile.require_sej()?;
        let (poll, cancel) = (self.poll.clone(), self.cancel.clone());

        let result = {
            let mut io = self.registers();
            let config = CryptoConfig::new(&mut io, profile.hw_code).with_poll(poll).with_cancel(cancel);
            let mut sej = Sej::new(config, base);
            seccfg::write_lock_state(flash, addr, &mut sej, flag).await
        };

        match result {
            Ok(seccfg) => Ok(seccfg),
            Err(e) => Err(self.fail(e).await),
        }
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.conn.close().await {
            debug!("Error while closing the link: {}", e);
        }
        self.mode = SessionMode::Disconnected;
        self.ids = None;
    }

    pub fn is_open(&self) -> bool {
        self.mode != SessionMode::Disconnected && self.conn.state() != LinkState::Disconnected
    }
}

/// [`CryptoIO`] over the BootROM read32/write32 commands.
pub struct RegisterAccess<'a> {
    conn: &'a mut Connection,
}

#[async_trait::async_trait]
impl CryptoIO for RegisterAccess<'_> {
    async fn read32(&mut self, addr: u32) -> Result<u32> {
        let words = self.conn.read32(addr, 1).await?;
        words.first().copied().ok_or_else(|| Error::umbra(format!("Empty read at 0x{:08X}", addr)))
    }

    async fn write32(&mut self, addr: u32, val: u32) -> Result<()> {
        self.conn.write32(addr, &[val]).await
    }

    async fn read_words(&mut self, addr: u32, count: usize) -> Result<Vec<u32>> {
        self.conn.read32(addr, count).await
    }

    async fn write_words(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        self.conn.write32(addr, words).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::command::ESCALATED_BAUDRATE;
    use crate::core::chip::{DEFAULT_SLOTS, PLACEHOLDER_LABELS};
    use crate::core::keys::{DerivationPath, KeyKind};
    use crate::error::ExploitFailure;
    use crate::sim::SimBrom;

    static SIM_PROFILE: ChipProfile = ChipProfile {
        hw_code: 0x0707,
        name: "SIM0707",
        watchdog: 0x1000_7000,
        brom_payload_addr: 0x0010_0A00,
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

    async fn session(brom: &SimBrom) -> Session {
        SessionBuilder::default()
            .with_port(Box::new(brom.port()))
            .with_connector(Box::new(brom.connector()))
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_identifies_chip() {
        let brom = SimBrom::new(0x0766);
        let s = session(&brom).await;

        assert_eq!(s.mode(), SessionMode::Connected);
        assert_eq!(s.hw_code(), 0x0766);
        assert_eq!(s.profile().map(|p| p.name), Some("MT6765"));
    }

    #[tokio::test]
    async fn test_exploit_then_derive_is_idempotent() {
        let brom = SimBrom::new(0x0766);
        let mut s = session(&brom).await;

        let outcome = s.exploit(&[0u8; 0x100], |_| {}).await.unwrap();
        assert_eq!(outcome.constant, 0x25);
        assert_eq!(s.mode(), SessionMode::Exploited);

        let request = DeriveRequest::default().with_otp([0x11; 32]);
        let first = s.derive_keys(&request).await.unwrap();
        assert_eq!(s.mode(), SessionMode::RegistersAccessible);
        let second = s.derive_keys(&request).await.unwrap();

        assert!(!first.is_empty());
        assert_eq!(first, second);
        assert!(first.iter().any(|k| k.provenance().path == DerivationPath::Sej));

        // Blacklist entries were overwritten through the engine
        let entry = s.profile().unwrap().blacklist[0];
        assert_eq!(brom.peek(entry.addr + 12), 0x80);
    }

    #[tokio::test]
    async fn test_stored_constant_skips_search() {
        let brom = SimBrom::new(0x0707);
        let mut store = MemoryConstantStore::new();
        store.store(0x0707, 0x42).unwrap();

        let mut s = SessionBuilder::default()
            .with_port(Box::new(brom.port()))
            .with_connector(Box::new(brom.connector()))
            .with_profile(&SIM_PROFILE)
            .with_store(Box::new(store))
            .connect()
            .await
            .unwrap();

        let mut attempts = 0;
        s.exploit(&[0u8; 16], |e| {
            if matches!(e, BruteForceEvent::Attempting { .. }) {
                attempts += 1;
            }
        })
        .await
        .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(s.constant(), Some(0x42));
    }

    #[tokio::test]
    async fn test_exhaustion_closes_session() {
        let brom = SimBrom::new(0x0707);
        brom.accept_constant(None);

        let mut s = SessionBuilder::default()
            .with_port(Box::new(brom.port()))
            .with_connector(Box::new(brom.connector()))
            .with_profile(&SIM_PROFILE)
            .with_exploit_options(ExploitOptions { start: 0xFE, ..Default::default() })
            .connect()
            .await
            .unwrap();

        let err = s.exploit(&[0u8; 16], |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::Exploit(ExploitFailure::ConstantNotFound { .. })));
        assert_eq!(s.mode(), SessionMode::Disconnected);
        assert!(s.last_error().is_some());
    }

    #[tokio::test]
    async fn test_derive_before_exploit_is_refused() {
        let brom = SimBrom::new(0x0766);
        let mut s = session(&brom).await;

        let err = s.derive_keys(&DeriveRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::Umbra(_)));
        assert_eq!(s.mode(), SessionMode::Connected);
    }

    #[tokio::test]
    async fn test_no_engine_fails_before_hardware() {
        let brom = SimBrom::new(0x0707);
        let mut s = SessionBuilder::default()
            .with_port(Box::new(brom.port()))
            .with_profile(&SIM_PROFILE)
            .connect()
            .await
            .unwrap();

        let request = DeriveRequest::default().with_kinds(&[KeyKind::RpmbKey]);
        let err = s.derive_keys(&request).await.unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(KeyDerivationUnavailable::NoHardwarePath { .. })));
    }

    #[tokio::test]
    #[should_panic(expected = "register access requires an exploited session")]
    async fn test_registers_before_exploit_panics() {
        let brom = SimBrom::new(0x0766);
        let mut s = session(&brom).await;
        let _ = s.registers();
    }

    #[tokio::test]
    async fn test_serial_session_stays_at_handshake_rate() {
        let brom = SimBrom::new(0x0707);
        let mut s = SessionBuilder::default()
            .with_port(Box::new(brom.serial_port()))
            .with_connector(Box::new(brom.connector()))
            .connect()
            .await
            .unwrap();

        assert_eq!(s.mode(), SessionMode::Connected);
        assert_eq!(s.connection().state(), LinkState::Connected);
        assert_eq!(s.connection().channel().baudrate(), 115200);
    }

    #[tokio::test]
    async fn test_serial_session_escalates_on_request() {
        let brom = SimBrom::new(0x0707);
        let mut s = SessionBuilder::default()
            .with_port(Box::new(brom.serial_port()))
            .escalate_baud(true)
            .connect()
            .await
            .unwrap();

        assert_eq!(s.connection().state(), LinkState::BaudEscalated);
        assert_eq!(s.connection().channel().baudrate(), ESCALATED_BAUDRATE);
    }

    #[tokio::test]
    async fn test_key_report_carries_pubk() {
        let brom = SimBrom::new(0x0766);
        let mut s = session(&brom).await;
        s.exploit(&[0u8; 0x100], |_| {}).await.unwrap();

        let pubk = s.read_pubk().await.unwrap();
        assert_eq!(pubk.len(), PUBK_LEN);
        assert_eq!(pubk, brom.pubk());

        let request = DeriveRequest::default().with_otp([0x11; 32]);
        let report = s.generate_keys(&request).await.unwrap();
        assert_eq!(report.pubk, Some(brom.pubk()));
        assert_eq!(report.ids.meid, brom.meid());
        assert!(!report.keys.is_empty());
    }

    #[tokio::test]
    async fn test_key_report_without_efuse() {
        let brom = SimBrom::new(0x0707);
        let mut s = SessionBuilder::default()
            .with_port(Box::new(brom.port()))
            .with_connector(Box::new(brom.connector()))
            .with_profile(&SIM_PROFILE)
            .with_exploit_options(ExploitOptions { start: 0x42, ..Default::default() })
            .connect()
            .await
            .unwrap();
        s.exploit(&[0u8; 16], |_| {}).await.unwrap();

        let err = s.read_pubk().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(s.mode(), SessionMode::Exploited);
    }
}
