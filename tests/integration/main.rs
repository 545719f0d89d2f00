//! End-to-end tests of the control loop against in-memory collaborators.
//!
//! Monitor timing tests run on paused tokio time so intervals advance
//! instantly and deterministically.

mod mocks;

use std::sync::Arc;
use std::time::Duration;

use lpsentinel::engine::{AgentStateMachine, ControllerConfig, RiskController, SharedStateMachine};
use lpsentinel::storage::{JsonFileStore, MemoryStore};
use lpsentinel::types::*;

use mocks::{funds, MockFunds, MockLedger};

fn config() -> ControllerConfig {
    ControllerConfig {
        settle_delay: Duration::ZERO,
        ..ControllerConfig::default()
    }
}

async fn running_machine(agent_id: &str) -> SharedStateMachine {
    let mut sm = AgentStateMachine::new(
        agent_id,
        AgentConfig::new("wallet-1", "Test maker", 0.1, 1.5),
        Arc::new(MemoryStore::new()),
    );
    sm.initialize().await;
    assert!(sm.handle_event(AgentEvent::Start).await);
    sm.into_shared()
}

/// Let spawned monitors run their immediate first ticks.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ---------------------------------------------------------------------------
// Registry lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_first_tick_runs_on_register() {
    let funds = MockFunds::healthy();
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    let machine = running_machine("lp-1").await;
    controller.register_agent("lp-1", machine.clone()).await;
    settle().await;

    assert_eq!(funds.calls(), 1);
    let sm = machine.lock().await;
    assert_eq!(sm.get_risk_history().len(), 1);
    assert_eq!(sm.get_risk_history()[0].assessment.risk_level, RiskLevel::Low);
    assert!(sm.funds().is_some());
    drop(sm);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ticks_follow_monitor_interval() {
    let funds = MockFunds::healthy();
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    controller.register_agent("lp-1", running_machine("lp-1").await).await;
    settle().await;
    tokio::time::sleep(Duration::from_secs(3 * 300)).await;

    // t = 0, 300, 600, 900
    assert_eq!(funds.calls(), 4);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_ticks_after_unregister() {
    let funds = MockFunds::healthy();
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    controller.register_agent("lp-1", running_machine("lp-1").await).await;
    settle().await;
    controller.unregister_agent("lp-1").await.unwrap();
    let calls = funds.calls();

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(funds.calls(), calls);
    assert!(!controller.is_registered("lp-1").await);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_waits_for_in_flight_tick() {
    let funds = MockFunds::healthy();
    funds.set_delay(Duration::from_secs(10));
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    let machine = running_machine("lp-1").await;
    controller.register_agent("lp-1", machine.clone()).await;
    settle().await;
    assert_eq!(funds.calls(), 1);
    assert!(machine.lock().await.funds().is_none());

    controller.unregister_agent("lp-1").await.unwrap();

    // The tick that was waiting on funds completed before unregister returned.
    let sm = machine.lock().await;
    assert!(sm.funds().is_some());
    assert_eq!(sm.get_risk_history().len(), 1);
    drop(sm);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(funds.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_unknown_agent() {
    let funds = MockFunds::healthy();
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    let err = controller.unregister_agent("ghost").await.unwrap_err();
    assert!(matches!(err, SentinelError::AgentNotRegistered(ref id) if id == "ghost"));
}

#[tokio::test(start_paused = true)]
async fn test_reregister_replaces_monitor() {
    let funds = MockFunds::healthy();
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    controller.register_agent("lp-1", running_machine("lp-1").await).await;
    settle().await;
    let replacement = running_machine("lp-1").await;
    controller.register_agent("lp-1", replacement.clone()).await;
    settle().await;

    // One immediate tick per registration, no duplicate monitor afterwards.
    assert_eq!(funds.calls(), 2);
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(funds.calls(), 3);

    assert_eq!(controller.agent_ids().await, vec!["lp-1".to_string()]);
    let current = controller.state_machine("lp-1").await.unwrap();
    assert!(Arc::ptr_eq(&current, &replacement));
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_every_monitor() {
    let funds = MockFunds::healthy();
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    for id in ["lp-1", "lp-2", "lp-3"] {
        controller.register_agent(id, running_machine(id).await).await;
    }
    settle().await;
    assert_eq!(funds.calls(), 3);

    controller.shutdown().await;
    assert!(controller.agent_ids().await.is_empty());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(funds.calls(), 3);
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_medium_risk_triggers_partial_reduction() {
    // ratio 0.02, one position: 5 - 1.6 - 1 = 2.4
    let funds = MockFunds::new(funds(0.2, 10.0, vec![("pool-a", 1000.0)]));
    let ledger = MockLedger::new(funds.clone());
    let controller = RiskController::new(funds.clone(), ledger.clone(), config());

    let machine = running_machine("lp-1").await;
    controller.register_agent("lp-1", machine.clone()).await;
    settle().await;

    let requests = ledger.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tx_type, TransactionType::RemoveLiquidity);
    assert_eq!(requests[0].priority, TransactionPriority::High);
    assert_eq!(requests[0].data["percentage"], 30.0);
    assert_eq!(requests[1].tx_type, TransactionType::SwapToSol);
    assert_eq!(requests[1].data["maxSlippage"], 2.0);
    assert!((funds.current().positions_value_usd() - 700.0).abs() < 1e-6);

    // Remediation is immediate; the state change waits for the window.
    let sm = machine.lock().await;
    assert_eq!(sm.state(), AgentState::Running);
    assert_eq!(sm.get_risk_history()[0].assessment.risk_level, RiskLevel::Medium);
    assert!(sm.last_error().is_none());
    drop(sm);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_assessment_failure_triggers_emergency_exit() {
    let funds = MockFunds::healthy();
    funds.fail_next(1);
    let ledger = MockLedger::new(funds.clone());
    let controller = RiskController::new(funds.clone(), ledger.clone(), config());

    let machine = running_machine("lp-1").await;
    controller.register_agent("lp-1", machine.clone()).await;
    settle().await;

    let requests = ledger.requests();
    let kinds: Vec<_> = requests
        .iter()
        .map(|r| (r.tx_type, r.pool_address().unwrap_or_default().to_string()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (TransactionType::RemoveLiquidity, "pool-a".to_string()),
            (TransactionType::SwapToSol, "pool-a".to_string()),
            (TransactionType::RemoveLiquidity, "pool-b".to_string()),
            (TransactionType::SwapToSol, "pool-b".to_string()),
        ]
    );
    assert!(requests.iter().all(|r| r.priority == TransactionPriority::Critical));
    assert!(funds.current().positions.is_empty());

    let sm = machine.lock().await;
    let risk = sm.get_risk_history();
    assert_eq!(risk[0].assessment.health_score, 0.0);
    assert_eq!(risk[0].assessment.risk_level, RiskLevel::High);
    assert!(sm.last_error().unwrap().contains("Risk assessment failed"));
    drop(sm);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_funds_moves_agent_to_waiting() {
    let funds = MockFunds::new(funds(0.05, 10.0, vec![("pool-a", 500.0), ("pool-b", 500.0)]));
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    let machine = running_machine("lp-1").await;
    controller.register_agent("lp-1", machine.clone()).await;
    settle().await;
    assert_eq!(machine.lock().await.state(), AgentState::Waiting);

    funds.set_funds(mocks::funds(5.0, 10.0, vec![("pool-a", 500.0), ("pool-b", 500.0)]));
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(machine.lock().await.state(), AgentState::Running);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_remediation_calls() {
    let funds = MockFunds::healthy();
    let ledger = MockLedger::new(funds.clone());
    let controller = RiskController::new(funds.clone(), ledger.clone(), config());
    controller.register_agent("lp-1", running_machine("lp-1").await).await;
    settle().await;

    assert!(controller.execute_partial_reduction("lp-1", 50.0).await.unwrap());
    assert!((funds.current().positions_value_usd() - 500.0).abs() < 1e-6);
    assert_eq!(ledger.requests()[0].pool_address(), Some("pool-a"));

    assert!(controller.execute_emergency_exit("lp-1", "operator").await.unwrap());
    assert!(funds.current().positions.is_empty());

    // Nothing left to exit.
    let before = ledger.requests().len();
    assert!(controller.execute_emergency_exit("lp-1", "again").await.unwrap());
    assert_eq!(ledger.requests().len(), before);

    assert!(controller.execute_emergency_exit("ghost", "x").await.is_err());
    controller.shutdown().await;
}

// ---------------------------------------------------------------------------
// State-check tick
// ---------------------------------------------------------------------------

fn reading(health_score: f64, risk_level: RiskLevel) -> RiskAssessment {
    RiskAssessment {
        health_score,
        risk_level,
        triggers: Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_state_check_resolves_on_trailing_average() {
    // Every tick reads medium risk (2.4), which alone never resolves a
    // partial reduction; only the trailing average can.
    let funds = MockFunds::new(funds(0.2, 10.0, vec![("pool-a", 1000.0)]));
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    let machine = running_machine("lp-1").await;
    {
        let mut sm = machine.lock().await;
        for _ in 0..3 {
            sm.handle_risk_assessment(reading(4.8, RiskLevel::Low)).await;
        }
        assert!(sm.handle_event(AgentEvent::RiskMedium).await);
        assert_eq!(sm.state(), AgentState::PartialReducing);
    }

    controller.register_agent("lp-1", machine.clone()).await;
    settle().await;

    let sm = machine.lock().await;
    let risk = sm.get_risk_history();
    assert_eq!(risk.last().unwrap().assessment.risk_level, RiskLevel::Medium);
    assert_eq!(sm.state(), AgentState::Running);
    let states: Vec<_> = sm.get_state_history().iter().map(|h| h.state).collect();
    assert_eq!(
        &states[states.len() - 2..],
        &[AgentState::PartialReducing, AgentState::Running]
    );
    drop(sm);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_state_check_recovers_stuck_emergency_exit() {
    let funds = MockFunds::healthy();
    let controller = RiskController::new(funds.clone(), MockLedger::new(funds.clone()), config());

    let machine = running_machine("lp-1").await;
    {
        let mut sm = machine.lock().await;
        let entered = chrono::Utc::now() - chrono::Duration::minutes(31);
        assert!(sm.handle_event_at(AgentEvent::UserEmergency, entered).await);
        assert_eq!(sm.state(), AgentState::EmergencyExit);
    }

    controller.register_agent("lp-1", machine.clone()).await;
    settle().await;

    // A healthy reading does not leave EMERGENCY_EXIT; the timed-out
    // recovery on the state-check tick forces STOP.
    let sm = machine.lock().await;
    assert_eq!(sm.state(), AgentState::Stopped);
    assert_eq!(sm.recovery_attempts(), 0);
    drop(sm);

    controller.shutdown().await;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_state_survives_restart() {
    let mut dir = std::env::temp_dir();
    dir.push(format!("lpsentinel_test_restart_{}", uuid::Uuid::new_v4()));
    let config = AgentConfig::new("wallet-1", "Test maker", 0.5, 1.5);

    {
        let store = Arc::new(JsonFileStore::new(&dir));
        let mut sm = AgentStateMachine::new("lp-1", config.clone(), store);
        assert!(!sm.initialize().await);
        assert!(sm.handle_event(AgentEvent::Start).await);
        sm.update_funds(funds(0.1, 10.0, vec![("pool-a", 100.0)])).await;
        assert_eq!(sm.state(), AgentState::Waiting);
    }

    let store = Arc::new(JsonFileStore::new(&dir));
    let mut restored = AgentStateMachine::new("lp-1", config, store);
    assert!(restored.initialize().await);
    assert_eq!(restored.state(), AgentState::Waiting);
    assert_eq!(restored.funds().unwrap().available_sol, 0.1);

    let states: Vec<_> = restored.get_state_history().iter().map(|h| h.state).collect();
    assert_eq!(
        states,
        vec![AgentState::Initializing, AgentState::Running, AgentState::Waiting]
    );

    let _ = std::fs::remove_dir_all(&dir);
}
