/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod config;
pub mod gcpu;
pub mod registers;
pub mod sej;

pub use config::{CryptoConfig, CryptoIO, PollConfig};
