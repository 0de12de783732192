/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod bytes;
pub mod cancel;

pub use cancel::CancelToken;
