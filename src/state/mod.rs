//! Refill state: data model, snapshot persistence and the aggregated board
//!
//! Handles:
//! - Per-asset refill attempts and their phases
//! - Snapshot persistence (in-memory or PostgreSQL) for restart recovery
//! - Change notification across processes sharing a database
//! - The merged view consumed by presentation

mod attempt;
mod board;
mod manager;
mod store;

pub use attempt::{
    Asset, IdSource, MessageIdRecord, RefillAttempt, RefillOutcome, RefillPhase, RefillStatus,
};
pub use board::{AttemptView, FaucetOverview, RefillBoard, RefillView, TankStatus};
pub use manager::StateManager;
pub use store::{MemorySnapshotStore, SnapshotStore};
