/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use log::info;
use tokio::fs::write;

use crate::cli::common::{CommandMetadata, PayloadArgs};
use crate::cli::helpers::exploit_with_progress;
use crate::cli::{CliContext, UmbraCommand};

#[derive(Args, Debug)]
pub struct ExploitArgs {
    #[command(flatten)]
    pub payload: PayloadArgs,
    /// Save the BootROM image sent back by the payload
    #[arg(short, long, value_name = "ROM_FILE")]
    pub dump: Option<PathBuf>,
}

impl CommandMetadata for ExploitArgs {
    fn about() -> &'static str {
        "Run the watchdog exploit and dump the BootROM."
    }

    fn long_about() -> &'static str {
        "Upload the payload through the BootROM and trigger it, searching for the \
         device-family constant the chip accepts. A constant found once is remembered \
         in the state file and tried first next time. Every failed attempt crashes \
         the device, which has to come back in BootROM mode before the next one."
    }
}

#[async_trait]
impl UmbraCommand for ExploitArgs {
    async fn run(&self, ctx: &mut CliContext) -> Result<()> {
        let payload = ctx.payload(&self.payload).await?;
        let mut session = ctx.session(self.payload.start).await?;

        let outcome = exploit_with_progress(&mut session, &payload).await?;
        info!("BootROM is 0x{:X} bytes, constant 0x{:02X}", outcome.rom.len(), outcome.constant);

        if let Some(path) = &self.dump {
            write(path, &outcome.rom).await?;
            info!("BootROM saved to {}", path.display());
        }

        session.close().await;
        Ok(())
    }
}
