/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use log::{info, warn};
use serde_json::{Map, Value, json};
use tokio::fs::{read, write};
use umbra::core::keys::otp_from_preloader;
use umbra::{DeriveRequest, KeyKind};

use crate::cli::common::{CommandMetadata, PayloadArgs};
use crate::cli::helpers::exploit_with_progress;
use crate::cli::{CliContext, UmbraCommand};
use crate::error::PError;

fn parse_kind(s: &str) -> Result<KeyKind, String> {
    KeyKind::ALL.iter().copied().find(|k| k.name().eq_ignore_ascii_case(s)).ok_or_else(|| {
        let names: Vec<&str> = KeyKind::ALL.iter().map(|k| k.name()).collect();
        format!("unknown key '{}', expected one of: {}", s, names.join(", "))
    })
}

fn parse_cid(s: &str) -> Result<[u8; 16], String> {
    let s = s.trim_start_matches("0x");
    let bytes = hex::decode(s).map_err(|e| format!("invalid CID: {}", e))?;
    bytes.try_into().map_err(|b: Vec<u8>| format!("CID must be 16 bytes, got {}", b.len()))
}

#[derive(Args, Debug)]
pub struct KeysArgs {
    #[command(flatten)]
    pub payload: PayloadArgs,
    /// eMMC CID as 32 hex characters, needed for the RPMB keys
    #[arg(long, value_parser = parse_cid)]
    pub cid: Option<[u8; 16]>,
    /// Preloader image to read the SEJ software OTP from
    #[arg(long = "pl", value_name = "PRELOADER_FILE")]
    pub preloader: Option<PathBuf>,
    /// Only derive these keys (comma separated)
    #[arg(short, long, value_delimiter = ',', value_parser = parse_kind)]
    pub kinds: Vec<KeyKind>,
    /// Also write the keys to a JSON file
    #[arg(short, long, value_name = "JSON_FILE")]
    pub output: Option<PathBuf>,
}

impl CommandMetadata for KeysArgs {
    fn aliases() -> &'static [&'static str] {
        &["derive"]
    }

    fn about() -> &'static str {
        "Exploit the device and derive its hardware-bound keys."
    }

    fn long_about() -> &'static str {
        "Run the exploit, unlock the crypto engine registers and derive the RPMB, FDE, TEE, \
         provisioning and MTEE keys the chip supports, next to the MEID, SOCID and efuse \
         public key hash. Keys without a hardware path on this chip are skipped. The output contains secrets, handle it accordingly."
    }
}

impl KeysArgs {
    async fn request(&self) -> Result<DeriveRequest> {
        let mut request = DeriveRequest::default();

        if !self.kinds.is_empty() {
            request = request.with_kinds(&self.kinds);
        }
        if let Some(cid) = self.cid {
            request = request.with_cid(cid);
        }
        if let Some(path) = &self.preloader {
            let preloader = read(path).await.with_context(|| format!("Failed to read {}", path.display()))?;
            match otp_from_preloader(&preloader) {
                Some(otp) => request = request.with_otp(otp),
                None => warn!("No software OTP in {}, using zeros", path.display()),
            }
        }

        Ok(request)
    }
}

#[async_trait]
impl UmbraCommand for KeysArgs {
    async fn run(&self, ctx: &mut CliContext) -> Result<()> {
        let request = self.request().await?;
        let payload = ctx.payload(&self.payload).await?;
        let mut session = ctx.session(self.payload.start).await?;

        exploit_with_progress(&mut session, &payload).await?;

        let report = session.generate_keys(&request).await.map_err(PError::from)?;
        session.close().await;

        info!("MEID   {}", hex::encode_upper(&report.ids.meid));
        info!("SOCID  {}", hex::encode_upper(&report.ids.socid));
        if let Some(pubk) = &report.pubk {
            info!("PUBK   {}", hex::encode_upper(pubk));
        }

        if report.keys.is_empty() {
            warn!("No key could be derived on this chip");
            return Ok(());
        }

        let mut out = Map::new();
        for key in &report.keys {
            let provenance = key.provenance();
            info!("{:<6} {} ({:?})", key.kind().name(), key.to_hex(), provenance.path);
            out.insert(
                key.kind().name().to_string(),
                json!({ "key": key.to_hex(), "engine": format!("{:?}", provenance.path) }),
            );
        }

        if let Some(path) = &self.output {
            let mut doc = Map::new();
            doc.insert("hw_code".into(), json!(format!("0x{:04X}", session.hw_code())));
            doc.insert("meid".into(), json!(hex::encode_upper(&report.ids.meid)));
            doc.insert("socid".into(), json!(hex::encode_upper(&report.ids.socid)));
            if let Some(pubk) = &report.pubk {
                doc.insert("pubk".into(), json!(hex::encode_upper(pubk)));
            }
            doc.insert("keys".into(), Value::Object(out));
            write(path, serde_json::to_vec_pretty(&Value::Object(doc))?).await?;
            info!("Keys written to {}", path.display());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("rpmb"), Ok(KeyKind::RpmbKey));
        assert_eq!(parse_kind("MTEE3"), Ok(KeyKind::Mtee3Key));
        assert!(parse_kind("foo").unwrap_err().contains("rpmb2"));
    }

    #[test]
    fn test_parse_cid() {
        let cid = parse_cid("0x150100524f4d4f4e0ba1b2c3d4e5f601").unwrap();
        assert_eq!(cid[0], 0x15);
        assert_eq!(cid[15], 0x01);
        assert!(parse_cid("1501").unwrap_err().contains("16 bytes"));
        assert!(parse_cid("zz").is_err());
    }
}
