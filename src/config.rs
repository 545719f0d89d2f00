//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Controller timings have defaults so a minimal config only needs the
//! storage/funds locations and the agent list.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use crate::engine::ControllerConfig;
use crate::storage::is_valid_agent_id;
use crate::types::{AgentConfig, SentinelError};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    pub storage: StorageConfig,
    pub funds: FundsConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub agents: Vec<AgentEntryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerSettings {
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_state_check_interval_secs")]
    pub state_check_interval_secs: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_partial_reduction_pct")]
    pub partial_reduction_pct: f64,
}

fn default_monitor_interval_secs() -> u64 {
    300
}

fn default_state_check_interval_secs() -> u64 {
    60
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_partial_reduction_pct() -> f64 {
    30.0
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            state_check_interval_secs: default_state_check_interval_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            partial_reduction_pct: default_partial_reduction_pct(),
        }
    }
}

impl ControllerSettings {
    pub fn to_controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            monitor_interval: Duration::from_secs(self.monitor_interval_secs),
            state_check_interval: Duration::from_secs(self.state_check_interval_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            partial_reduction_pct: self.partial_reduction_pct,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one JSON snapshot per agent.
    pub state_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FundsConfig {
    /// Directory where the collector writes per-agent funds reports.
    pub snapshot_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { dry_run: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentEntryConfig {
    pub id: String,
    pub name: String,
    pub wallet_address: String,
    pub min_sol_balance: f64,
    pub min_health_score: f64,
}

impl AgentEntryConfig {
    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig::new(
            &self.wallet_address,
            &self.name,
            self.min_sol_balance,
            self.min_health_score,
        )
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the control loop cannot run safely with.
    pub fn validate(&self) -> Result<(), SentinelError> {
        let c = &self.controller;
        if c.monitor_interval_secs == 0 || c.state_check_interval_secs == 0 {
            return Err(SentinelError::Config("intervals must be positive".into()));
        }
        if !(c.partial_reduction_pct > 0.0 && c.partial_reduction_pct <= 100.0) {
            return Err(SentinelError::Config(format!(
                "partial_reduction_pct must be in (0, 100], got {}",
                c.partial_reduction_pct
            )));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !is_valid_agent_id(&agent.id) {
                return Err(SentinelError::Config(format!(
                    "agent id {:?} must be non-empty and use only A-Z, a-z, 0-9, '-' or '_'",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(SentinelError::Config(format!("duplicate agent id: {}", agent.id)));
            }
            if agent.wallet_address.trim().is_empty() {
                return Err(SentinelError::Config(format!(
                    "agent {} has an empty wallet address",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}
