/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Error as AnyError;
use umbra::error::Error as UmbraError;

/// Carries a library error into `anyhow`, adding the re-seat hint when the session was lost.
#[derive(Debug)]
pub struct PError(pub UmbraError);

impl From<UmbraError> for PError {
    fn from(err: UmbraError) -> Self {
        PError(err)
    }
}

impl From<PError> for AnyError {
    fn from(err: PError) -> Self {
        if err.0.is_fatal() {
            AnyError::new(err.0).context("Session lost, re-plug the device in BootROM mode and retry")
        } else {
            AnyError::new(err.0)
        }
    }
}
