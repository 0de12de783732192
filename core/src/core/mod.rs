/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod chip;
pub mod crypto;
pub mod keys;
pub mod seccfg;
