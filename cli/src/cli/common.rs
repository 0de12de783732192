/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use clap::Args;
use clap_num::maybe_hex;

#[derive(Args, Debug)]
pub struct PayloadArgs {
    /// The payload uploaded by the exploit
    #[arg(short, long, value_name = "PAYLOAD_FILE")]
    pub payload: Option<PathBuf>,
    /// First device-family constant to try when none is remembered
    #[arg(long, value_parser = maybe_hex::<u8>)]
    pub start: Option<u8>,
}

/// A trait for providing metadata for CLI commands.
/// This trait can be implemented by command structs to give additional info
pub trait CommandMetadata {
    fn aliases() -> &'static [&'static str] {
        &[]
    }
    fn visible_aliases() -> &'static [&'static str] {
        &[]
    }
    fn about() -> &'static str {
        ""
    }
    fn long_about() -> &'static str {
        ""
    }
    fn hide() -> bool {
        false
    }
}
