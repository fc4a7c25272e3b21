//! Domain entities
//!
//! Structure shared between the orchestrator (persists, schedules) and
//! remote runners (execute). Lifecycle logic lives on the entities; the
//! owning service handles persistence and concurrency.

pub mod debug;
pub mod execution;
pub mod job;
pub mod run;
pub mod runner;
pub mod step;
pub mod workspace;
