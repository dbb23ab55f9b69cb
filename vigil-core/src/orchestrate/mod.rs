//! Validation orchestrator.
//!
//! For each work item: cache lookup by content hash, validator selection
//! through the policy table, bounded concurrent execution with per-call
//! timeouts, then cache write, history record and report delivery. The
//! validator semaphore is shared by every call in the process.

pub mod cache;
pub mod policy;
pub mod runner;
pub mod validator;

pub use cache::ResultCache;
pub use policy::{Selection, ValidationPolicy};
pub use runner::{Orchestrator, OrchestratorDeps, READ_FAILURE_RULE};
pub use validator::{
    AGENT_FAILURE_RULE, FileContent, PatternValidator, PolicyContext, StructuredDataValidator,
    Validator, ValidatorError, ValidatorRegistry,
};
