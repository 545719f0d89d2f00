//! Funds reporting.
//!
//! The control loop never sources balances itself; it asks a
//! `FundsManager`. The bundled `FileFundsManager` reads the per-agent
//! snapshots that the market-data collector writes to disk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::storage::agent_file_name;
use crate::types::FundsStatus;

/// Reports current balances and positions for an agent's wallet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FundsManager: Send + Sync {
    /// May fail; callers must treat a failure as unknown (i.e. high) risk.
    async fn get_funds_status(&self, agent_id: &str, wallet_address: &str) -> Result<FundsStatus>;
}

/// On-disk funds report written by the collector for one agent.
#[derive(Debug, serde::Deserialize)]
struct FundsFile {
    wallet_address: String,
    #[serde(flatten)]
    funds: FundsStatus,
}

/// Reads `<dir>/<agent_id>.json`.
pub struct FileFundsManager {
    dir: PathBuf,
}

impl FileFundsManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl FundsManager for FileFundsManager {
    async fn get_funds_status(&self, agent_id: &str, wallet_address: &str) -> Result<FundsStatus> {
        let path = self.dir.join(agent_file_name(agent_id));
        let json = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read funds report {}", path.display()))?;
        let file: FundsFile = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse funds report {}", path.display()))?;

        if file.wallet_address != wallet_address {
            anyhow::bail!(
                "Funds report {} is for wallet {}, expected {}",
                path.display(),
                file.wallet_address,
                wallet_address
            );
        }

        debug!(agent_id, funds = %file.funds, "Funds report loaded");
        Ok(file.funds)
    }
}
