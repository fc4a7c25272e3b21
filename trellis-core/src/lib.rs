//! Core types for Trellis
//!
//! This crate contains:
//! - The generic state-machine engine and the four lifecycle machines
//!   (pipeline run, step execution, workspace, debug session)
//! - Domain entities shared between the orchestrator and remote runners
//! - Execution idempotency keys and trigger dedup keys
//! - The runner wire protocol (messages + timeouts)
//!
//! Note: Persistence and scheduling logic live in the orchestrator.

pub mod domain;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod routing;
pub mod statemachine;
