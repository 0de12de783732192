/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use log::info;
use umbra::connection::port::detect;

use crate::cli::common::CommandMetadata;
use crate::cli::{CliContext, UmbraCommand};
use crate::error::PError;

#[derive(Args, Debug)]
pub struct DetectArgs {
    /// Handshake with the first device found and print what it reports
    #[arg(short, long)]
    pub identify: bool,
}

impl CommandMetadata for DetectArgs {
    fn visible_aliases() -> &'static [&'static str] {
        &["ls"]
    }

    fn about() -> &'static str {
        "List connected MediaTek devices."
    }

    fn long_about() -> &'static str {
        "List every connected port with a known MediaTek vendor and product id. \
         With --identify, wait for a device, handshake with it and print its hardware code, \
         versions, security configuration and unique ids."
    }
}

#[async_trait]
impl UmbraCommand for DetectArgs {
    async fn run(&self, ctx: &mut CliContext) -> Result<()> {
        let found = detect().await;
        if found.is_empty() {
            info!("No MediaTek device found");
        }
        for addr in &found {
            info!("{:04X}:{:04X} {:?} at {}", addr.vid, addr.pid, addr.connection_type, addr.location);
        }

        if !self.identify {
            return Ok(());
        }

        let mut session = ctx.session(None).await?;
        let name = session.profile().map(|p| p.name).unwrap_or("unknown");
        info!("Chip: {} (0x{:04X})", name, session.hw_code());

        let conn = session.connection();
        let (sub_code, hw_ver, sw_ver) = conn.get_hw_sw_ver().await.map_err(PError::from)?;
        info!("Sub code: 0x{:04X}, HW: 0x{:04X}, SW: 0x{:04X}", sub_code, hw_ver, sw_ver);

        let target_config = conn.get_target_config().await.map_err(PError::from)?;
        info!("=====================================");
        info!("SBC: {}", (target_config & 0x1) != 0);
        info!("SLA: {}", (target_config & 0x2) != 0);
        info!("DAA: {}", (target_config & 0x4) != 0);
        info!("=====================================");

        let meid = conn.get_meid().await.map_err(PError::from)?;
        info!("MEID: {}", hex::encode_upper(&meid));
        match conn.get_soc_id().await {
            Ok(soc_id) => info!("SoC ID: {}", hex::encode_upper(&soc_id)),
            Err(e) => info!("SoC ID not available: {}", e),
        }

        session.close().await;
        Ok(())
    }
}
