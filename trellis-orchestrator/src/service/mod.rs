//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between repositories and contain domain logic.

pub mod dedup;
pub mod execution;
pub mod executor;
pub mod locks;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod run;
pub mod workspace;

// Re-export for convenience
pub use execution as execution_service;
pub use recovery as recovery_service;
pub use run as run_service;
