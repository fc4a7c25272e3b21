//! Repository layer
//!
//! All database access lives here. Each entity mutation is one
//! statement (or one transaction), so state-machine updates stay
//! single-writer per row.

pub mod execution;
pub mod run;
pub mod runner;
pub mod trigger;

pub use execution as execution_repository;
pub use run as run_repository;
pub use runner as runner_repository;
pub use trigger as trigger_repository;
