//! Job orchestration across the analytic domains.

pub mod orchestrator;

pub use orchestrator::JobOrchestrator;
