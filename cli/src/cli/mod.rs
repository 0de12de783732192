/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod commands;
mod common;
mod helpers;
mod macros;
mod settings;
mod state;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{CommandFactory, Parser};
use log::info;
use tokio::fs::read;
use tokio::time::sleep;
use umbra::{Session, SessionBuilder, find_mtk_port};

use crate::cli::commands::*;
use crate::cli::common::PayloadArgs;
use crate::cli::macros::umbra_commands;
use crate::cli::settings::Settings;
use crate::cli::state::{PersistedDeviceState, StateStore};
use crate::error::PError;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Enable verbose logging, including debug information
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Configuration file to use instead of the default one
    #[arg(long, value_name = "CONFIG_FILE", global = true)]
    pub config: Option<PathBuf>,
    /// Raise the serial baud rate after the handshake (no effect over USB)
    #[arg(long, global = true)]
    pub escalate_baud: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

umbra_commands! {
    Detect(DetectArgs),
    Exploit(ExploitArgs),
    Keys(KeysArgs),
    Config(ConfigArgs),
}

#[async_trait]
pub trait UmbraCommand {
    async fn run(&self, ctx: &mut CliContext) -> Result<()>;
}

pub struct CliContext {
    pub settings: Settings,
    pub config_path: Option<PathBuf>,
}

impl CliContext {
    /// Waits for a MediaTek port and brings a session up on it.
    pub async fn session(&self, start: Option<u8>) -> Result<Session> {
        info!("Waiting for MTK device...");
        let port = loop {
            if let Some(port) = find_mtk_port().await {
                info!("Found MTK port: {}", port.get_port_name());
                break port;
            }
            sleep(Duration::from_millis(self.settings.exploit.reconnect_interval_ms)).await;
        };

        let session = SessionBuilder::default()
            .with_port(port)
            .with_channel_config(self.settings.channel_config())
            .with_poll_config(self.settings.poll_config())
            .with_exploit_options(self.settings.exploit_options(start))
            .with_connector(Box::new(self.settings.connector()))
            .escalate_baud(self.settings.link.escalate_baud)
            .with_store(Box::new(StateStore::open(&self.settings.state_file)))
            .connect()
            .await
            .map_err(PError::from)?;

        let mut state = PersistedDeviceState::load(&self.settings.state_file);
        if state.hw_code != session.hw_code() {
            state.hw_code = session.hw_code();
            state.save(&self.settings.state_file).map_err(PError::from)?;
        }

        Ok(session)
    }

    /// Reads the payload named on the command line, or the configured one.
    pub async fn payload(&self, args: &PayloadArgs) -> Result<Vec<u8>> {
        let Some(path) = args.payload.as_ref().or(self.settings.exploit.payload.as_ref()) else {
            bail!("No payload given, pass --payload or set exploit.payload in the configuration");
        };

        read(path).await.with_context(|| format!("Failed to read payload {}", path.display()))
    }
}

pub async fn run_cli(args: &CliArgs) -> Result<()> {
    let Some(cmd) = &args.command else {
        CliArgs::command().print_help()?;
        return Ok(());
    };

    let config_path = args.config.clone().or_else(Settings::default_path);
    let mut settings = Settings::load(config_path.as_deref())?;
    if args.escalate_baud {
        settings.link.escalate_baud = true;
    }

    let mut ctx = CliContext { settings, config_path };
    cmd.run(&mut ctx).await
}
