//! Core engine — per-agent state machines and the risk control loop.

pub mod controller;
pub mod executor;
pub mod funds;
pub mod state_machine;

pub use controller::{ControllerConfig, RiskController};
pub use state_machine::{AgentStateMachine, SharedStateMachine, StateChangeListener};
