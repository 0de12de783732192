/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod connection;
pub mod core;
pub mod error;
pub mod exploit;
pub mod session;
pub mod utilities;

#[cfg(test)]
mod sim;

pub use crate::connection::port::{MTKPort, find_mtk_port};
pub use crate::core::chip::ChipProfile;
pub use crate::core::keys::{DeriveRequest, DerivedKeyMaterial, KeyKind, KeyReport};
pub use crate::error::{Error, Result};
pub use crate::session::{Session, SessionBuilder, SessionMode, connect};
