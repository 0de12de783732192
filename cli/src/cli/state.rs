/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::collections::BTreeMap;
use std::fs::{read, remove_file, write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use umbra::error::{Error, Result};
use umbra::exploit::ConstantStore;

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct PersistedDeviceState {
    /// Device-family constant accepted by each hardware code.
    pub constants: BTreeMap<u16, u8>,
    pub hw_code: u16,
    pub meid: Vec<u8>,
    pub soc_id: Vec<u8>,
}

impl PersistedDeviceState {
    /// Loads the state from `path`.
    /// Returns default state if file doesn't exist or parsing fails.
    pub fn load(path: &Path) -> Self {
        match read(path) {
            Ok(json) => serde_json::from_slice(&json).unwrap_or_default(),
            Err(_) => PersistedDeviceState::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| Error::io(e.to_string()))?;
        write(path, json).map_err(|e| Error::io(format!("Failed to write state file: {}", e)))
    }

    /// Resets the current state and deletes the persisted file if it exists.
    pub fn reset(&mut self, path: &Path) -> Result<()> {
        if path.exists() {
            remove_file(path).map_err(|e| Error::io(e.to_string()))?;
        }
        *self = PersistedDeviceState::default();
        Ok(())
    }
}

/// Backs the brute force's constant memory with the state file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PersistedDeviceState,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = PersistedDeviceState::load(&path);
        StateStore { path, state }
    }
}

impl ConstantStore for StateStore {
    fn load(&self, hw_code: u16) -> Option<u8> {
        self.state.constants.get(&hw_code).copied()
    }

    fn store(&mut self, hw_code: u16, constant: u8) -> Result<()> {
        // Another command may have written the file since we opened it
        self.state = PersistedDeviceState::load(&self.path);
        self.state.constants.insert(hw_code, constant);
        self.state.hw_code = hw_code;
        debug!("Remembering constant 0x{:02X} for 0x{:04X}", constant, hw_code);
        self.state.save(&self.path)
    }
}
