/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod spinner;

use anyhow::Result;
use log::debug;
use umbra::Session;
use umbra::exploit::{BruteForceEvent, ExploitOutcome};

use self::spinner::UmbraSpinner;
use crate::error::PError;

/// Runs the exploit, reporting the constant search on a spinner.
pub async fn exploit_with_progress(session: &mut Session, payload: &[u8]) -> Result<ExploitOutcome> {
    let spinner = UmbraSpinner::new("Starting exploit");

    let result = session
        .exploit(payload, |event| match event {
            BruteForceEvent::Attempting { constant } => {
                spinner.set_message(format!("Trying constant 0x{:02X}", constant));
            }
            BruteForceEvent::WaitingForDevice { constant } => {
                spinner.set_message(format!("Waiting for BootROM (constant 0x{:02X})", constant));
            }
            BruteForceEvent::AttemptFailed { constant, reason } => {
                debug!("0x{:02X}: {}", constant, reason);
            }
            BruteForceEvent::Found { constant } => {
                spinner.set_message(format!("Found constant 0x{:02X}", constant));
            }
        })
        .await;

    match result {
        Ok(outcome) => {
            spinner.finish(&format!("Exploit done with constant 0x{:02X}", outcome.constant));
            Ok(outcome)
        }
        Err(e) => {
            spinner.abandon("Exploit failed");
            Err(PError::from(e).into())
        }
    }
}
