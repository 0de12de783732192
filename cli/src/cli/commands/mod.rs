/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod config;
pub mod detect;
pub mod exploit;
pub mod keys;

pub use config::ConfigArgs;
pub use detect::DetectArgs;
pub use exploit::ExploitArgs;
pub use keys::KeysArgs;
