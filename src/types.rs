//! Shared types for the LP-SENTINEL control loop.
//!
//! These types form the data model used across the state machine, the
//! risk controller, persistence, and the dashboard. They are kept free of
//! behaviour that depends on collaborators so every module can depend on
//! them without circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of entries kept in each bounded history ring.
pub const HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

/// Immutable per-agent parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub wallet_address: String,
    pub name: String,
    /// Below this available SOL balance the agent waits for funds.
    pub min_sol_balance: f64,
    pub emergency_thresholds: EmergencyThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyThresholds {
    /// Health score at or below which the high-risk window starts.
    pub min_health_score: f64,
}

impl AgentConfig {
    pub fn new(wallet_address: &str, name: &str, min_sol_balance: f64, min_health_score: f64) -> Self {
        Self {
            wallet_address: wallet_address.to_string(),
            name: name.to_string(),
            min_sol_balance,
            emergency_thresholds: EmergencyThresholds { min_health_score },
        }
    }
}

// ---------------------------------------------------------------------------
// Funds
// ---------------------------------------------------------------------------

/// Balances and open liquidity positions of an agent wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsStatus {
    pub total_value_usd: f64,
    pub total_value_sol: f64,
    pub available_sol: f64,
    pub positions: Vec<Position>,
}

impl FundsStatus {
    /// Sum of the USD value of all open positions.
    pub fn positions_value_usd(&self) -> f64 {
        self.positions.iter().map(|p| p.value_usd).sum()
    }
}

impl fmt::Display for FundsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total=${:.2} ({:.4} SOL) available={:.4} SOL positions={}",
            self.total_value_usd,
            self.total_value_sol,
            self.available_sol,
            self.positions.len(),
        )
    }
}

/// An open liquidity position. Protocol-specific fields are carried
/// through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pool_address: String,
    pub value_usd: f64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl Position {
    pub fn new(pool_address: &str, value_usd: f64) -> Self {
        Self {
            pool_address: pool_address.to_string(),
            value_usd,
            extra: serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// A single signal that contributed to a risk assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskTrigger {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    pub threshold: f64,
}

/// Output of one risk evaluation. `health_score` is on a 0–5 scale,
/// 5 being healthiest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub health_score: f64,
    pub risk_level: RiskLevel,
    pub triggers: Vec<RiskTrigger>,
}

impl RiskAssessment {
    /// The fallback used whenever risk cannot be measured.
    pub fn unknown(reason: &str) -> Self {
        Self {
            health_score: 0.0,
            risk_level: RiskLevel::High,
            triggers: vec![RiskTrigger {
                kind: format!("assessment_failure: {reason}"),
                value: 0.0,
                threshold: 0.0,
            }],
        }
    }
}

impl fmt::Display for RiskAssessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "health={:.2} risk={} triggers={}",
            self.health_score,
            self.risk_level,
            self.triggers.len(),
        )
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle and risk posture of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Initializing,
    Running,
    Waiting,
    PartialReducing,
    EmergencyExit,
    Stopped,
}

impl AgentState {
    pub const ALL: &'static [AgentState] = &[
        AgentState::Initializing,
        AgentState::Running,
        AgentState::Waiting,
        AgentState::PartialReducing,
        AgentState::EmergencyExit,
        AgentState::Stopped,
    ];

    /// The state reached by applying `event`, or `None` when the event is
    /// not accepted in this state.
    pub fn next(self, event: AgentEvent) -> Option<AgentState> {
        use AgentEvent as E;
        use AgentState as S;

        match (self, event) {
            (S::Initializing, E::Start) => Some(S::Running),

            (S::Running, E::Stop) => Some(S::Stopped),
            (S::Running, E::FundsLow) => Some(S::Waiting),
            (S::Running, E::RiskMedium) => Some(S::PartialReducing),
            (S::Running, E::RiskHigh | E::UserEmergency) => Some(S::EmergencyExit),

            (S::Waiting, E::FundsSufficient) => Some(S::Running),
            (S::Waiting, E::Stop) => Some(S::Stopped),
            (S::Waiting, E::UserEmergency) => Some(S::EmergencyExit),

            (S::PartialReducing, E::RiskResolved) => Some(S::Running),
            (S::PartialReducing, E::RiskHigh | E::UserEmergency) => Some(S::EmergencyExit),
            (S::PartialReducing, E::Stop) => Some(S::Stopped),

            (S::EmergencyExit, E::Stop) => Some(S::Stopped),

            (S::Stopped, E::Start) => Some(S::Running),

            _ => None,
        }
    }

    /// Steady states never time out.
    pub fn is_steady(self) -> bool {
        matches!(self, AgentState::Running | AgentState::Stopped)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Initializing => write!(f, "INITIALIZING"),
            AgentState::Running => write!(f, "RUNNING"),
            AgentState::Waiting => write!(f, "WAITING"),
            AgentState::PartialReducing => write!(f, "PARTIAL_REDUCING"),
            AgentState::EmergencyExit => write!(f, "EMERGENCY_EXIT"),
            AgentState::Stopped => write!(f, "STOPPED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEvent {
    Start,
    Stop,
    FundsLow,
    FundsSufficient,
    RiskMedium,
    RiskHigh,
    RiskResolved,
    UserEmergency,
}

impl AgentEvent {
    pub const ALL: &'static [AgentEvent] = &[
        AgentEvent::Start,
        AgentEvent::Stop,
        AgentEvent::FundsLow,
        AgentEvent::FundsSufficient,
        AgentEvent::RiskMedium,
        AgentEvent::RiskHigh,
        AgentEvent::RiskResolved,
        AgentEvent::UserEmergency,
    ];

    /// Events whose acceptance clears the stuck-state recovery counter.
    pub fn resets_recovery(self) -> bool {
        matches!(
            self,
            AgentEvent::Start | AgentEvent::Stop | AgentEvent::FundsSufficient | AgentEvent::RiskResolved
        )
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::Start => write!(f, "START"),
            AgentEvent::Stop => write!(f, "STOP"),
            AgentEvent::FundsLow => write!(f, "FUNDS_LOW"),
            AgentEvent::FundsSufficient => write!(f, "FUNDS_SUFFICIENT"),
            AgentEvent::RiskMedium => write!(f, "RISK_MEDIUM"),
            AgentEvent::RiskHigh => write!(f, "RISK_HIGH"),
            AgentEvent::RiskResolved => write!(f, "RISK_RESOLVED"),
            AgentEvent::UserEmergency => write!(f, "USER_EMERGENCY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: AgentState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskHistoryEntry {
    pub assessment: RiskAssessment,
    pub timestamp: DateTime<Utc>,
}

/// Externally visible view of an agent, handed to listeners and the
/// dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub agent_id: String,
    pub state: AgentState,
    pub config: AgentConfig,
    pub funds: Option<FundsStatus>,
    pub last_update: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl fmt::Display for AgentStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.agent_id, self.state, self.config.name)?;
        if let Some(ref funds) = self.funds {
            write!(f, " | {funds}")?;
        }
        if let Some(ref err) = self.last_error {
            write!(f, " | last_error: {err}")?;
        }
        Ok(())
    }
}

/// Everything needed to rebuild an `AgentStateMachine` after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub state: AgentState,
    pub config: AgentConfig,
    pub funds: Option<FundsStatus>,
    pub last_update: DateTime<Utc>,
    pub last_error: Option<String>,
    pub state_start_time: DateTime<Utc>,
    pub recovery_attempts: u32,
    pub medium_risk_start_time: Option<DateTime<Utc>>,
    pub high_risk_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub high_risk_fired: bool,
    pub state_history: Vec<StateHistoryEntry>,
    pub risk_history: Vec<RiskHistoryEntry>,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    RemoveLiquidity,
    SwapToSol,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::RemoveLiquidity => write!(f, "REMOVE_LIQUIDITY"),
            TransactionType::SwapToSol => write!(f, "SWAP_TO_SOL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionPriority {
    Critical,
    High,
}

impl fmt::Display for TransactionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionPriority::Critical => write!(f, "CRITICAL"),
            TransactionPriority::High => write!(f, "HIGH"),
        }
    }
}

/// One remediation step handed to the transaction executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub priority: TransactionPriority,
    pub data: serde_json::Value,
}

impl TransactionRequest {
    /// Pool the request targets, if present in `data`.
    pub fn pool_address(&self) -> Option<&str> {
        self.data.get("poolAddress").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub success: bool,
    pub signature: Option<String>,
    pub error: Option<String>,
}

impl TransactionOutcome {
    pub fn ok(signature: impl Into<String>) -> Self {
        Self {
            success: true,
            signature: Some(signature.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            signature: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Which half of a remediation step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationStep {
    RemoveLiquidity,
    Swap,
}

impl fmt::Display for RemediationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationStep::RemoveLiquidity => write!(f, "remove liquidity"),
            RemediationStep::Swap => write!(f, "swap to SOL"),
        }
    }
}

/// Domain-specific error types for LP-SENTINEL.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SentinelError {
    #[error("Invalid transition for agent {agent_id}: {event} not accepted in {state}")]
    InvalidTransition {
        agent_id: String,
        state: AgentState,
        event: AgentEvent,
    },

    #[error("Risk assessment failed for agent {agent_id}: {message}")]
    AssessmentFailure { agent_id: String, message: String },

    #[error("Remediation step failed for agent {agent_id} ({step} on {pool_address}): {message}")]
    RemediationStepFailure {
        agent_id: String,
        pool_address: String,
        step: RemediationStep,
        message: String,
    },

    #[error("Persistence error for agent {agent_id}: {message}")]
    PersistenceFailure { agent_id: String, message: String },

    #[error("Recovery exhausted for agent {agent_id} in {state} after {attempts} attempts")]
    RecoveryExhausted {
        agent_id: String,
        state: AgentState,
        attempts: u32,
    },

    #[error("Agent not registered: {0}")]
    AgentNotRegistered(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
