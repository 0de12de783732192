/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::core::chip::ChipProfile;

/// Code uploaded through the send-payload command, word aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Vec<u8>,
    pub load_addr: u32,
}

impl Payload {
    pub fn new(data: &[u8], load_addr: u32) -> Self {
        let mut data = data.to_vec();
        data.resize(data.len().next_multiple_of(4), 0);
        Payload { data, load_addr }
    }

    pub fn for_profile(profile: &ChipProfile, data: &[u8]) -> Self {
        Self::new(data, profile.brom_payload_addr)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
