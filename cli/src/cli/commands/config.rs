/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::{Result, bail};
use async_trait::async_trait;
use clap::{Args, Subcommand};
use clap_num::maybe_hex;
use log::info;
use tokio::fs::{create_dir_all, try_exists, write};

use crate::cli::common::CommandMetadata;
use crate::cli::settings::Settings;
use crate::cli::state::PersistedDeviceState;
use crate::cli::{CliContext, UmbraCommand};
use crate::error::PError;

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print where the configuration file is read from
    Path,
    /// Forget remembered device-family constants
    Forget {
        /// Only forget the constant of this hardware code
        #[arg(value_parser = maybe_hex::<u16>)]
        hw_code: Option<u16>,
    },
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

impl CommandMetadata for ConfigArgs {
    fn visible_aliases() -> &'static [&'static str] {
        &["cfg"]
    }

    fn about() -> &'static str {
        "Manage the configuration and the remembered device state."
    }
}

#[async_trait]
impl UmbraCommand for ConfigArgs {
    async fn run(&self, ctx: &mut CliContext) -> Result<()> {
        match &self.action {
            ConfigAction::Init { force } => {
                let Some(path) = &ctx.config_path else {
                    bail!("No configuration directory on this system, pass --config");
                };
                if try_exists(path).await? && !force {
                    bail!("{} already exists, use --force to overwrite it", path.display());
                }
                if let Some(dir) = path.parent() {
                    create_dir_all(dir).await?;
                }
                write(path, Settings::default().to_toml()?).await?;
                info!("Wrote {}", path.display());
            }
            ConfigAction::Show => {
                println!("{}", ctx.settings.to_toml()?);
            }
            ConfigAction::Path => match &ctx.config_path {
                Some(path) => println!("{}", path.display()),
                None => info!("No configuration directory on this system"),
            },
            ConfigAction::Forget { hw_code } => {
                let path = &ctx.settings.state_file;
                let mut state = PersistedDeviceState::load(path);
                match hw_code {
                    Some(code) => {
                        if state.constants.remove(code).is_some() {
                            state.save(path).map_err(PError::from)?;
                            info!("Forgot the constant of 0x{:04X}", code);
                        } else {
                            info!("No constant remembered for 0x{:04X}", code);
                        }
                    }
                    None => {
                        state.reset(path).map_err(PError::from)?;
                        info!("Device state cleared");
                    }
                }
            }
        }

        Ok(())
    }
}
