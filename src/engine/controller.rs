//! Risk controller — the per-agent monitoring loop.
//!
//! For every registered agent a monitor task periodically queries funds,
//! scores health, feeds the assessment to the agent's state machine, and
//! executes remediation (partial reduction or emergency exit) through the
//! transaction executor. Remediation runs independently of the state
//! machine's hysteresis so capital protection is never delayed by its
//! confirmation windows.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::executor::TransactionExecutor;
use super::funds::FundsManager;
use super::state_machine::SharedStateMachine;
use crate::types::{
    FundsStatus, RemediationStep, RiskAssessment, RiskLevel, RiskTrigger, SentinelError,
    TransactionPriority, TransactionRequest, TransactionType,
};

// ---------------------------------------------------------------------------
// Constants & configuration
// ---------------------------------------------------------------------------

pub const MAX_HEALTH_SCORE: f64 = 5.0;
/// Available/total SOL ratio below which health is penalised.
pub const LOW_AVAILABLE_RATIO: f64 = 0.1;
pub const AVAILABLE_RATIO_PENALTY: f64 = 20.0;
pub const SINGLE_POSITION_PENALTY: f64 = 1.0;
pub const HIGH_RISK_HEALTH: f64 = 1.5;
pub const MEDIUM_RISK_HEALTH: f64 = 2.5;

pub const EMERGENCY_MAX_SLIPPAGE: f64 = 5.0;
pub const PARTIAL_MAX_SLIPPAGE: f64 = 2.0;
/// Allowed gap between requested and achieved reduction (as a fraction).
pub const REDUCTION_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often each agent's risk is assessed.
    pub monitor_interval: Duration,
    /// How often each agent's state timeouts and trailing health are checked.
    pub state_check_interval: Duration,
    /// Wait between removing liquidity and swapping the proceeds.
    pub settle_delay: Duration,
    /// Percentage of liquidity removed on medium risk.
    pub partial_reduction_pct: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(300),
            state_check_interval: Duration::from_secs(60),
            settle_delay: Duration::from_secs(2),
            partial_reduction_pct: 30.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Health scoring
// ---------------------------------------------------------------------------

/// Score an agent's funds on the 0–5 health scale.
///
/// ```text
/// ratio  = available_sol / total_value_sol
/// health = 5.0
///        - (0.1 - ratio) * 20   if ratio < 0.1
///        - 1.0                  if exactly one position
/// ```
pub fn compute_health(funds: &FundsStatus) -> RiskAssessment {
    let available_ratio = funds.available_sol / funds.total_value_sol;
    let mut health_score = MAX_HEALTH_SCORE;
    let mut triggers = Vec::new();

    // A NaN ratio (empty wallet) compares false and is not penalised.
    if available_ratio < LOW_AVAILABLE_RATIO {
        health_score -= (LOW_AVAILABLE_RATIO - available_ratio) * AVAILABLE_RATIO_PENALTY;
        triggers.push(RiskTrigger {
            kind: "low_available_ratio".to_string(),
            value: available_ratio,
            threshold: LOW_AVAILABLE_RATIO,
        });
    }

    if funds.positions.len() == 1 {
        health_score -= SINGLE_POSITION_PENALTY;
        triggers.push(RiskTrigger {
            kind: "position_concentration".to_string(),
            value: 1.0,
            threshold: 1.0,
        });
    }

    let risk_level = if health_score <= HIGH_RISK_HEALTH {
        RiskLevel::High
    } else if health_score <= MEDIUM_RISK_HEALTH {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    RiskAssessment {
        health_score,
        risk_level,
        triggers,
    }
}

// ---------------------------------------------------------------------------
// Registry entries
// ---------------------------------------------------------------------------

/// Everything a monitor tick needs for one agent, without touching the
/// registry.
#[derive(Clone)]
struct AgentHandle {
    agent_id: String,
    wallet_address: String,
    machine: SharedStateMachine,
    /// Serialises remediation for this agent.
    remediation: Arc<Mutex<()>>,
}

struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the task and wait for it to exit. No tick runs after this
    /// returns.
    async fn stop(self, agent_id: &str) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(agent_id, "Monitor task panicked");
            }
        }
    }
}

struct AgentEntry {
    handle: AgentHandle,
    monitor: MonitorHandle,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Collaborators and settings shared by the controller and its monitor
/// tasks.
struct Services {
    funds: Arc<dyn FundsManager>,
    executor: Arc<dyn TransactionExecutor>,
    config: ControllerConfig,
}

pub struct RiskController {
    services: Arc<Services>,
    agents: RwLock<HashMap<String, AgentEntry>>,
    /// Serialises register/unregister/shutdown.
    registry_ops: Mutex<()>,
}

impl RiskController {
    pub fn new(
        funds: Arc<dyn FundsManager>,
        executor: Arc<dyn TransactionExecutor>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            services: Arc::new(Services {
                funds,
                executor,
                config,
            }),
            agents: RwLock::new(HashMap::new()),
            registry_ops: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.services.config
    }

    /// Start monitoring an agent. The first assessment runs immediately.
    /// Re-registering an id stops and replaces the previous monitor.
    pub async fn register_agent(&self, agent_id: &str, machine: SharedStateMachine) {
        let _ops = self.registry_ops.lock().await;

        let previous = self.agents.write().await.remove(agent_id);
        if let Some(previous) = previous {
            warn!(agent_id, "Agent already registered, replacing monitor");
            previous.monitor.stop(agent_id).await;
        }

        let wallet_address = machine.lock().await.config().wallet_address.clone();
        let handle = AgentHandle {
            agent_id: agent_id.to_string(),
            wallet_address,
            machine,
            remediation: Arc::new(Mutex::new(())),
        };
        let monitor = spawn_monitor(self.services.clone(), handle.clone());

        self.agents
            .write()
            .await
            .insert(agent_id.to_string(), AgentEntry { handle, monitor });

        info!(
            agent_id,
            interval_secs = self.services.config.monitor_interval.as_secs(),
            "Agent registered"
        );
    }

    /// Stop monitoring an agent and wait for its monitor to exit.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<(), SentinelError> {
        let _ops = self.registry_ops.lock().await;

        let entry = self
            .agents
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| SentinelError::AgentNotRegistered(agent_id.to_string()))?;

        entry.monitor.stop(agent_id).await;
        info!(agent_id, "Agent unregistered");
        Ok(())
    }

    /// Stop every monitor.
    pub async fn shutdown(&self) {
        let _ops = self.registry_ops.lock().await;
        let entries: Vec<(String, AgentEntry)> = self.agents.write().await.drain().collect();
        let count = entries.len();

        futures::future::join_all(
            entries
                .into_iter()
                .map(|(id, entry)| async move { entry.monitor.stop(&id).await }),
        )
        .await;

        info!(agents = count, "Risk controller shut down");
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn state_machine(&self, agent_id: &str) -> Option<SharedStateMachine> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|e| e.handle.machine.clone())
    }

    async fn handle(&self, agent_id: &str) -> Result<AgentHandle, SentinelError> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| SentinelError::AgentNotRegistered(agent_id.to_string()))
    }

    /// Assess an agent's risk. Any failure, including an unknown agent,
    /// yields the high-risk default.
    pub async fn assess_risk(&self, agent_id: &str) -> RiskAssessment {
        match self.handle(agent_id).await {
            Ok(handle) => self.services.assess(&handle).await.1,
            Err(e) => {
                warn!(agent_id, error = %e, "Cannot assess risk");
                RiskAssessment::unknown(&e.to_string())
            }
        }
    }

    /// Feed an assessment to the agent's state machine and remediate
    /// immediately on medium or high risk.
    pub async fn handle_risk(&self, agent_id: &str, assessment: RiskAssessment) -> Result<(), SentinelError> {
        let handle = self.handle(agent_id).await?;
        self.services.handle_risk(&handle, assessment).await;
        Ok(())
    }

    /// Remove all liquidity and swap to SOL. `Ok(true)` when no positions
    /// remain afterwards.
    pub async fn execute_emergency_exit(&self, agent_id: &str, reason: &str) -> Result<bool, SentinelError> {
        let handle = self.handle(agent_id).await?;
        Ok(self.services.emergency_exit(&handle, reason).await)
    }

    /// Remove `percentage`% of every position, largest first. `Ok(true)`
    /// when the achieved reduction is within tolerance of the request.
    pub async fn execute_partial_reduction(&self, agent_id: &str, percentage: f64) -> Result<bool, SentinelError> {
        let handle = self.handle(agent_id).await?;
        Ok(self.services.partial_reduction(&handle, percentage).await)
    }
}

// ---------------------------------------------------------------------------
// Monitoring & remediation
// ---------------------------------------------------------------------------

fn spawn_monitor(services: Arc<Services>, agent: AgentHandle) -> MonitorHandle {
    let (stop, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut monitor = tokio::time::interval(services.config.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state_check = tokio::time::interval(services.config.state_check_interval);
        state_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = monitor.tick() => services.run_tick(&agent).await,
                _ = state_check.tick() => services.run_state_check(&agent).await,
            }
        }
        debug!(agent_id = %agent.agent_id, "Monitor stopped");
    });

    MonitorHandle { stop, task }
}

impl Services {
    async fn run_tick(&self, agent: &AgentHandle) {
        let (funds, assessment) = self.assess(agent).await;
        if let Some(funds) = funds {
            agent.machine.lock().await.update_funds(funds).await;
        }
        self.handle_risk(agent, assessment).await;
    }

    async fn run_state_check(&self, agent: &AgentHandle) {
        agent.machine.lock().await.periodic_check().await;
    }

    async fn assess(&self, agent: &AgentHandle) -> (Option<FundsStatus>, RiskAssessment) {
        match self
            .funds
            .get_funds_status(&agent.agent_id, &agent.wallet_address)
            .await
        {
            Ok(funds) => {
                let assessment = compute_health(&funds);
                debug!(agent_id = %agent.agent_id, %assessment, "Risk assessed");
                (Some(funds), assessment)
            }
            Err(e) => {
                let err = SentinelError::AssessmentFailure {
                    agent_id: agent.agent_id.clone(),
                    message: format!("{e:#}"),
                };
                warn!(agent_id = %agent.agent_id, error = %err, "Assuming high risk");
                agent.machine.lock().await.record_error(&err).await;
                (None, RiskAssessment::unknown(&format!("{e:#}")))
            }
        }
    }

    async fn handle_risk(&self, agent: &AgentHandle, assessment: RiskAssessment) {
        let level = assessment.risk_level;
        let health = assessment.health_score;
        agent
            .machine
            .lock()
            .await
            .handle_risk_assessment(assessment)
            .await;

        match level {
            RiskLevel::High => {
                let reason = format!("high risk (health {health:.2})");
                self.emergency_exit(agent, &reason).await;
            }
            RiskLevel::Medium => {
                self.partial_reduction(agent, self.config.partial_reduction_pct).await;
            }
            RiskLevel::Low => {}
        }
    }

    async fn fetch_funds(&self, agent: &AgentHandle) -> Option<FundsStatus> {
        match self
            .funds
            .get_funds_status(&agent.agent_id, &agent.wallet_address)
            .await
        {
            Ok(funds) => Some(funds),
            Err(e) => {
                let err = SentinelError::AssessmentFailure {
                    agent_id: agent.agent_id.clone(),
                    message: format!("{e:#}"),
                };
                error!(agent_id = %agent.agent_id, error = %err, "Funds unavailable during remediation");
                agent.machine.lock().await.record_error(&err).await;
                None
            }
        }
    }

    async fn emergency_exit(&self, agent: &AgentHandle, reason: &str) -> bool {
        let _remediating = agent.remediation.lock().await;

        let Some(funds) = self.fetch_funds(agent).await else {
            return false;
        };
        if funds.positions.is_empty() {
            info!(agent_id = %agent.agent_id, "Emergency exit: no positions");
            return true;
        }

        warn!(
            agent_id = %agent.agent_id,
            reason,
            positions = funds.positions.len(),
            value_usd = funds.positions_value_usd(),
            "Executing emergency exit"
        );

        for position in &funds.positions {
            let pool = &position.pool_address;
            let remove = TransactionRequest {
                agent_id: agent.agent_id.clone(),
                tx_type: TransactionType::RemoveLiquidity,
                priority: TransactionPriority::Critical,
                data: json!({ "poolAddress": pool, "percentage": 100.0, "reason": reason }),
            };
            if self.run_step(agent, remove, RemediationStep::RemoveLiquidity, pool).await.is_err() {
                continue;
            }

            self.settle().await;

            let swap = TransactionRequest {
                agent_id: agent.agent_id.clone(),
                tx_type: TransactionType::SwapToSol,
                priority: TransactionPriority::Critical,
                data: json!({ "poolAddress": pool, "maxSlippage": EMERGENCY_MAX_SLIPPAGE }),
            };
            let _ = self.run_step(agent, swap, RemediationStep::Swap, pool).await;
        }

        let Some(after) = self.fetch_funds(agent).await else {
            return false;
        };
        let remaining = after.positions.len();
        if remaining == 0 {
            info!(agent_id = %agent.agent_id, "Emergency exit complete");
        } else {
            error!(agent_id = %agent.agent_id, remaining, "Emergency exit left positions open");
        }
        remaining == 0
    }

    async fn partial_reduction(&self, agent: &AgentHandle, percentage: f64) -> bool {
        let _remediating = agent.remediation.lock().await;

        let Some(funds) = self.fetch_funds(agent).await else {
            return false;
        };
        if funds.positions.is_empty() {
            info!(agent_id = %agent.agent_id, "Partial reduction: no positions");
            return true;
        }

        let initial_value = funds.positions_value_usd();
        let mut positions = funds.positions;
        // Largest positions first; value stands in for risk.
        positions.sort_by(|a, b| {
            b.value_usd
                .partial_cmp(&a.value_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        info!(
            agent_id = %agent.agent_id,
            percentage,
            positions = positions.len(),
            value_usd = initial_value,
            "Executing partial reduction"
        );

        for position in &positions {
            let pool = &position.pool_address;
            let remove = TransactionRequest {
                agent_id: agent.agent_id.clone(),
                tx_type: TransactionType::RemoveLiquidity,
                priority: TransactionPriority::High,
                data: json!({ "poolAddress": pool, "percentage": percentage }),
            };
            if self.run_step(agent, remove, RemediationStep::RemoveLiquidity, pool).await.is_err() {
                continue;
            }

            self.settle().await;

            let swap = TransactionRequest {
                agent_id: agent.agent_id.clone(),
                tx_type: TransactionType::SwapToSol,
                priority: TransactionPriority::High,
                data: json!({ "poolAddress": pool, "maxSlippage": PARTIAL_MAX_SLIPPAGE }),
            };
            let _ = self.run_step(agent, swap, RemediationStep::Swap, pool).await;
        }

        let Some(after) = self.fetch_funds(agent).await else {
            return false;
        };
        if initial_value <= 0.0 {
            return true;
        }
        let final_value = after.positions_value_usd();
        let success = reduction_within_tolerance(initial_value, final_value, percentage);

        info!(
            agent_id = %agent.agent_id,
            initial_value,
            final_value,
            target_pct = percentage,
            success,
            "Partial reduction complete"
        );
        success
    }

    /// Execute one remediation transaction, logging and recording failure.
    async fn run_step(
        &self,
        agent: &AgentHandle,
        request: TransactionRequest,
        step: RemediationStep,
        pool: &str,
    ) -> Result<(), SentinelError> {
        let message = match self.executor.execute_transaction(request).await {
            Ok(outcome) if outcome.success => {
                debug!(agent_id = %agent.agent_id, pool, %step, signature = ?outcome.signature, "Step succeeded");
                return Ok(());
            }
            Ok(outcome) => outcome.error.unwrap_or_else(|| "transaction rejected".to_string()),
            Err(e) => format!("{e:#}"),
        };

        let err = SentinelError::RemediationStepFailure {
            agent_id: agent.agent_id.clone(),
            pool_address: pool.to_string(),
            step,
            message,
        };
        warn!(agent_id = %agent.agent_id, pool, error = %err, "Remediation step failed, continuing");
        agent.machine.lock().await.record_error(&err).await;
        Err(err)
    }

    async fn settle(&self) {
        // TODO: replace with confirmation polling once the executor reports
        // transaction signatures that can be awaited.
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
    }
}

/// Whether the achieved reduction is within `REDUCTION_TOLERANCE` of the
/// requested percentage.
pub fn reduction_within_tolerance(initial_value: f64, final_value: f64, percentage: f64) -> bool {
    let actual = (initial_value - final_value) / initial_value;
    (actual - percentage / 100.0).abs() <= REDUCTION_TOLERANCE
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
