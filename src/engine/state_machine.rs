//! Per-agent lifecycle and risk-posture state machine.
//!
//! Owns one agent's current `AgentState`, the transition rules, the
//! hysteresis windows that turn noisy risk readings into escalation
//! events, stuck-state recovery, and the bounded state/risk histories.
//! Every accepted transition is persisted and announced to listeners.
//!
//! Time-dependent operations have an `*_at` variant taking an explicit
//! `now`; the plain variants use the wall clock.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::storage::StatePersistence;
use crate::types::{
    AgentConfig, AgentEvent, AgentSnapshot, AgentState, AgentStatusReport, FundsStatus,
    RiskAssessment, RiskHistoryEntry, SentinelError, StateHistoryEntry, HISTORY_LIMIT,
};

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Sub-threshold readings must persist this long before `RISK_HIGH`.
pub const HIGH_RISK_WINDOW_MINS: i64 = 5;
/// Medium-band readings must persist this long before `RISK_MEDIUM`.
pub const MEDIUM_RISK_WINDOW_MINS: i64 = 10;
/// Health scores at or below this (and above the emergency threshold) are medium risk.
pub const MEDIUM_HEALTH_THRESHOLD: f64 = 2.5;
/// A non-steady state held longer than this is considered stuck.
pub const STATE_TIMEOUT_MINS: i64 = 30;
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;
/// Trailing window averaged by `periodic_check`.
pub const RESOLUTION_WINDOW_MINS: i64 = 15;
/// Average health above which a partial reduction is considered resolved.
pub const RESOLUTION_AVERAGE_HEALTH: f64 = 3.0;

/// A state machine shared between the monitor task and readers.
/// The mutex is the single-writer guarantee for one agent.
pub type SharedStateMachine = Arc<tokio::sync::Mutex<AgentStateMachine>>;

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Observer notified synchronously after every accepted transition.
///
/// Errors and panics raised by a listener are logged and never reach the
/// state machine.
pub trait StateChangeListener: Send + Sync {
    fn on_state_change(&self, status: &AgentStatusReport) -> anyhow::Result<()>;
}

impl<F> StateChangeListener for F
where
    F: Fn(&AgentStatusReport) -> anyhow::Result<()> + Send + Sync,
{
    fn on_state_change(&self, status: &AgentStatusReport) -> anyhow::Result<()> {
        self(status)
    }
}

/// Handle returned by `add_state_change_listener`, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub struct AgentStateMachine {
    agent_id: String,
    config: AgentConfig,
    state: AgentState,
    funds: Option<FundsStatus>,
    last_update: DateTime<Utc>,
    last_error: Option<String>,
    state_start_time: DateTime<Utc>,
    recovery_attempts: u32,
    medium_risk_start_time: Option<DateTime<Utc>>,
    high_risk_start_time: Option<DateTime<Utc>>,
    /// Set once the current high-risk episode has escalated, so it
    /// escalates once.
    high_risk_fired: bool,
    state_history: VecDeque<StateHistoryEntry>,
    risk_history: VecDeque<RiskHistoryEntry>,
    listeners: Vec<(ListenerId, Arc<dyn StateChangeListener>)>,
    next_listener_id: u64,
    persistence: Arc<dyn StatePersistence>,
}

impl AgentStateMachine {
    /// Create a machine in `INITIALIZING`. Call `initialize` to restore any
    /// persisted snapshot.
    pub fn new(agent_id: &str, config: AgentConfig, persistence: Arc<dyn StatePersistence>) -> Self {
        let now = Utc::now();
        let mut state_history = VecDeque::with_capacity(HISTORY_LIMIT);
        state_history.push_back(StateHistoryEntry {
            state: AgentState::Initializing,
            timestamp: now,
        });

        Self {
            agent_id: agent_id.to_string(),
            config,
            state: AgentState::Initializing,
            funds: None,
            last_update: now,
            last_error: None,
            state_start_time: now,
            recovery_attempts: 0,
            medium_risk_start_time: None,
            high_risk_start_time: None,
            high_risk_fired: false,
            state_history,
            risk_history: VecDeque::with_capacity(HISTORY_LIMIT),
            listeners: Vec::new(),
            next_listener_id: 0,
            persistence,
        }
    }

    /// Convenience for wrapping a machine for the controller.
    pub fn into_shared(self) -> SharedStateMachine {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Rebuild in-memory state from the persisted snapshot, if one exists.
    /// Without a snapshot the fresh state is persisted instead.
    ///
    /// Returns `true` when a snapshot was restored. Load failures are
    /// logged and the machine keeps its fresh state.
    pub async fn initialize(&mut self) -> bool {
        match self.persistence.load_state(&self.agent_id).await {
            Ok(Some(snapshot)) => {
                self.restore(snapshot);
                info!(
                    agent_id = %self.agent_id,
                    state = %self.state,
                    recovery_attempts = self.recovery_attempts,
                    "Resumed from saved state"
                );
                true
            }
            Ok(None) => {
                info!(agent_id = %self.agent_id, "Fresh start");
                self.persist().await;
                false
            }
            Err(e) => {
                let err = SentinelError::PersistenceFailure {
                    agent_id: self.agent_id.clone(),
                    message: format!("{e:#}"),
                };
                error!(agent_id = %self.agent_id, error = %err, "Failed to load state, starting fresh");
                self.last_error = Some(err.to_string());
                false
            }
        }
    }

    fn restore(&mut self, snapshot: AgentSnapshot) {
        if snapshot.config != self.config {
            warn!(agent_id = %self.agent_id, "Persisted config differs from configured, keeping configured");
        }
        self.state = snapshot.state;
        self.funds = snapshot.funds;
        self.last_update = self.last_update.max(snapshot.last_update);
        self.last_error = snapshot.last_error;
        self.state_start_time = snapshot.state_start_time;
        self.recovery_attempts = snapshot.recovery_attempts.min(MAX_RECOVERY_ATTEMPTS);
        self.medium_risk_start_time = snapshot.medium_risk_start_time;
        self.high_risk_start_time = snapshot.high_risk_start_time;
        self.high_risk_fired = snapshot.high_risk_fired;
        self.state_history = bounded(snapshot.state_history);
        self.risk_history = bounded(snapshot.risk_history);
    }

    // -- Accessors -------------------------------------------------------

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn funds(&self) -> Option<&FundsStatus> {
        self.funds.as_ref()
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn state_start_time(&self) -> DateTime<Utc> {
        self.state_start_time
    }

    pub fn get_status(&self) -> AgentStatusReport {
        AgentStatusReport {
            agent_id: self.agent_id.clone(),
            state: self.state,
            config: self.config.clone(),
            funds: self.funds.clone(),
            last_update: self.last_update,
            last_error: self.last_error.clone(),
        }
    }

    pub fn get_state_history(&self) -> Vec<StateHistoryEntry> {
        self.state_history.iter().cloned().collect()
    }

    pub fn get_risk_history(&self) -> Vec<RiskHistoryEntry> {
        self.risk_history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            state: self.state,
            config: self.config.clone(),
            funds: self.funds.clone(),
            last_update: self.last_update,
            last_error: self.last_error.clone(),
            state_start_time: self.state_start_time,
            recovery_attempts: self.recovery_attempts,
            medium_risk_start_time: self.medium_risk_start_time,
            high_risk_start_time: self.high_risk_start_time,
            high_risk_fired: self.high_risk_fired,
            state_history: self.get_state_history(),
            risk_history: self.get_risk_history(),
        }
    }

    // -- Listeners -------------------------------------------------------

    pub fn add_state_change_listener(&mut self, listener: Arc<dyn StateChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_state_change_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn notify_listeners(&self) {
        if self.listeners.is_empty() {
            return;
        }
        let status = self.get_status();
        for (id, listener) in &self.listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_state_change(&status))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(agent_id = %self.agent_id, listener = id.0, error = %e, "State listener failed");
                }
                Err(_) => {
                    error!(agent_id = %self.agent_id, listener = id.0, "State listener panicked");
                }
            }
        }
    }

    // -- Events ----------------------------------------------------------

    /// Apply an event. Returns `false` (state unchanged) when the event is
    /// not accepted in the current state.
    pub async fn handle_event(&mut self, event: AgentEvent) -> bool {
        self.handle_event_at(event, Utc::now()).await
    }

    pub async fn handle_event_at(&mut self, event: AgentEvent, now: DateTime<Utc>) -> bool {
        let Some(next) = self.state.next(event) else {
            let err = SentinelError::InvalidTransition {
                agent_id: self.agent_id.clone(),
                state: self.state,
                event,
            };
            warn!(agent_id = %self.agent_id, state = %self.state, event = %event, "{err}");
            return false;
        };

        let from = self.state;
        self.state = next;
        self.state_start_time = now;
        self.touch(now);
        if event.resets_recovery() {
            self.recovery_attempts = 0;
        }
        self.state_history.push_back(StateHistoryEntry {
            state: next,
            timestamp: now,
        });
        while self.state_history.len() > HISTORY_LIMIT {
            self.state_history.pop_front();
        }

        info!(agent_id = %self.agent_id, from = %from, to = %next, event = %event, "State transition");

        self.persist().await;
        self.notify_listeners();
        true
    }

    /// Replace the cached funds and derive `FUNDS_LOW` / `FUNDS_SUFFICIENT`.
    pub async fn update_funds(&mut self, funds: FundsStatus) {
        self.update_funds_at(funds, Utc::now()).await
    }

    pub async fn update_funds_at(&mut self, funds: FundsStatus, now: DateTime<Utc>) {
        let low = funds.available_sol < self.config.min_sol_balance;
        debug!(agent_id = %self.agent_id, funds = %funds, low, "Funds updated");
        self.funds = Some(funds);
        self.touch(now);

        match self.state {
            AgentState::Running if low => {
                self.handle_event_at(AgentEvent::FundsLow, now).await;
            }
            AgentState::Waiting if !low => {
                self.handle_event_at(AgentEvent::FundsSufficient, now).await;
            }
            _ => {}
        }

        self.persist().await;
    }

    /// Feed one risk assessment through the hysteresis windows.
    pub async fn handle_risk_assessment(&mut self, assessment: RiskAssessment) {
        self.handle_risk_assessment_at(assessment, Utc::now()).await
    }

    pub async fn handle_risk_assessment_at(&mut self, assessment: RiskAssessment, now: DateTime<Utc>) {
        let health = assessment.health_score;
        self.risk_history.push_back(RiskHistoryEntry {
            assessment,
            timestamp: now,
        });
        while self.risk_history.len() > HISTORY_LIMIT {
            self.risk_history.pop_front();
        }
        self.touch(now);

        if health <= self.config.emergency_thresholds.min_health_score {
            let started = *self.high_risk_start_time.get_or_insert(now);
            let elapsed = now - started;
            debug!(agent_id = %self.agent_id, health, elapsed_secs = elapsed.num_seconds(), "High-risk window open");

            if !self.high_risk_fired
                && elapsed >= Duration::minutes(HIGH_RISK_WINDOW_MINS)
                && self.state.next(AgentEvent::RiskHigh).is_some()
                && self.handle_event_at(AgentEvent::RiskHigh, now).await
            {
                self.high_risk_fired = true;
            }
        } else if health <= MEDIUM_HEALTH_THRESHOLD {
            self.high_risk_start_time = None;
            self.high_risk_fired = false;

            let started = *self.medium_risk_start_time.get_or_insert(now);
            let elapsed = now - started;
            debug!(agent_id = %self.agent_id, health, elapsed_secs = elapsed.num_seconds(), "Medium-risk window open");

            if elapsed >= Duration::minutes(MEDIUM_RISK_WINDOW_MINS) && self.state == AgentState::Running {
                self.handle_event_at(AgentEvent::RiskMedium, now).await;
            }
        } else {
            self.clear_risk_windows();
            if self.state == AgentState::PartialReducing {
                self.handle_event_at(AgentEvent::RiskResolved, now).await;
            }
        }

        self.persist().await;
    }

    fn clear_risk_windows(&mut self) {
        self.medium_risk_start_time = None;
        self.high_risk_start_time = None;
        self.high_risk_fired = false;
    }

    // -- Timeouts & recovery ---------------------------------------------

    /// Returns `true` if the current state had timed out and recovery ran.
    pub async fn check_state_timeout(&mut self) -> bool {
        self.check_state_timeout_at(Utc::now()).await
    }

    pub async fn check_state_timeout_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.is_steady() {
            return false;
        }
        let held = now - self.state_start_time;
        if held < Duration::minutes(STATE_TIMEOUT_MINS) {
            return false;
        }

        warn!(
            agent_id = %self.agent_id,
            state = %self.state,
            held_mins = held.num_minutes(),
            "State timeout, attempting recovery"
        );
        self.attempt_state_recovery_at(now).await;
        true
    }

    /// One recovery attempt for a stuck state. The attempt that reaches
    /// `MAX_RECOVERY_ATTEMPTS` forces `USER_EMERGENCY` instead.
    pub async fn attempt_state_recovery(&mut self) {
        self.attempt_state_recovery_at(Utc::now()).await
    }

    pub async fn attempt_state_recovery_at(&mut self, now: DateTime<Utc>) {
        self.recovery_attempts = (self.recovery_attempts + 1).min(MAX_RECOVERY_ATTEMPTS);
        let state = self.state;

        let transitioned = if self.recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
            let err = SentinelError::RecoveryExhausted {
                agent_id: self.agent_id.clone(),
                state,
                attempts: self.recovery_attempts,
            };
            error!(agent_id = %self.agent_id, state = %state, "{err}");
            self.last_error = Some(err.to_string());

            if state.next(AgentEvent::UserEmergency).is_some() {
                self.handle_event_at(AgentEvent::UserEmergency, now).await
            } else {
                error!(agent_id = %self.agent_id, state = %state, "Operator intervention required");
                false
            }
        } else {
            info!(
                agent_id = %self.agent_id,
                state = %state,
                attempt = self.recovery_attempts,
                "Recovery attempt"
            );
            match self.recovery_event() {
                Some(event) => self.handle_event_at(event, now).await,
                None => false,
            }
        };

        if !transitioned {
            // Re-arm the timeout so the next attempt waits a full window.
            self.state_start_time = now;
        }
        self.persist().await;
    }

    /// The corrective event for the current state, if any applies.
    fn recovery_event(&self) -> Option<AgentEvent> {
        match self.state {
            AgentState::PartialReducing => {
                let latest = self.risk_history.back()?;
                let health = latest.assessment.health_score;
                if health > MEDIUM_HEALTH_THRESHOLD {
                    Some(AgentEvent::RiskResolved)
                } else if health <= self.config.emergency_thresholds.min_health_score {
                    Some(AgentEvent::RiskHigh)
                } else {
                    debug!(agent_id = %self.agent_id, health, "Risk still medium, staying in partial reduction");
                    None
                }
            }
            AgentState::Waiting => {
                let funds = self.funds.as_ref()?;
                (funds.available_sol >= self.config.min_sol_balance).then_some(AgentEvent::FundsSufficient)
            }
            AgentState::EmergencyExit => Some(AgentEvent::Stop),
            other => {
                info!(agent_id = %self.agent_id, state = %other, "No recovery action for state");
                None
            }
        }
    }

    /// Timeout check plus the smoothed resolution signal for partial
    /// reductions.
    pub async fn periodic_check(&mut self) {
        self.periodic_check_at(Utc::now()).await
    }

    pub async fn periodic_check_at(&mut self, now: DateTime<Utc>) {
        self.check_state_timeout_at(now).await;

        if self.state != AgentState::PartialReducing {
            return;
        }
        if let Some(avg) = self.average_health_since(now - Duration::minutes(RESOLUTION_WINDOW_MINS)) {
            debug!(agent_id = %self.agent_id, avg_health = avg, "Trailing health average");
            if avg > RESOLUTION_AVERAGE_HEALTH {
                info!(agent_id = %self.agent_id, avg_health = avg, "Trailing health recovered");
                self.handle_event_at(AgentEvent::RiskResolved, now).await;
            }
        }
    }

    /// Mean health score of assessments recorded at or after `since`.
    pub fn average_health_since(&self, since: DateTime<Utc>) -> Option<f64> {
        let recent: Vec<f64> = self
            .risk_history
            .iter()
            .filter(|e| e.timestamp >= since)
            .map(|e| e.assessment.health_score)
            .collect();
        if recent.is_empty() {
            None
        } else {
            Some(recent.iter().sum::<f64>() / recent.len() as f64)
        }
    }

    // -- Errors & persistence --------------------------------------------

    /// Surface an error through `get_status().last_error`.
    pub async fn record_error(&mut self, err: &SentinelError) {
        self.last_error = Some(err.to_string());
        self.touch(Utc::now());
        self.persist().await;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_update = self.last_update.max(now);
    }

    async fn persist(&mut self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.persistence.save_state(&self.agent_id, &snapshot).await {
            let err = SentinelError::PersistenceFailure {
                agent_id: self.agent_id.clone(),
                message: format!("{e:#}"),
            };
            error!(agent_id = %self.agent_id, error = %err, "Failed to save state");
            self.last_error = Some(err.to_string());
        }
    }
}

fn bounded<T>(entries: Vec<T>) -> VecDeque<T> {
    let skip = entries.len().saturating_sub(HISTORY_LIMIT);
    entries.into_iter().skip(skip).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
