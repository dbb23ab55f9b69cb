//! # Vigil Core
//!
//! Continuous validation pipeline: watches source trees, decides which edits
//! are worth checking, coalesces bursts, runs pluggable validators under a
//! global concurrency cap and aggregates their findings into reports. A
//! supervisor keeps the whole thing alive through crashes.
//!
//! ## Architecture
//!
//! - [`watch`]: filesystem watcher and initial scan producing [`types::ChangeEvent`]s
//! - [`detect`]: significance verdict backed by the [`store`]
//! - [`debounce`]: per-path quiescence window and one-in-flight-per-path dispatch
//! - [`orchestrate`]: validator routing, result cache and bounded execution
//! - [`feedback`]: dedupe, ordering, prioritisation and notification
//! - [`supervisor`]: health sampling, restart policy and lifecycle states
//!
//! ```no_run
//! use vigil_core::config::VigilConfig;
//! use vigil_core::supervisor::{PipelineService, Supervisor};
//!
//! async fn run(config: VigilConfig) -> i32 {
//!     let service = PipelineService::new(config.clone());
//!     let outcome = Supervisor::new(config, service)
//!         .run(tokio_util::sync::CancellationToken::new())
//!         .await;
//!     outcome.exit_code()
//! }
//! ```

#![allow(missing_docs)]

/// Configuration model shared by every stage
pub mod config;

/// Per-path quiescence and single-flight dispatch
pub mod debounce;

/// Change significance verdicts
pub mod detect;

/// Error types and retry helper
pub mod error;

/// Report aggregation and notifiers
pub mod feedback;

/// Content hashing
pub mod hash;

/// Shared pipeline counters
pub mod metrics;

/// Validator routing, caching and execution
pub mod orchestrate;

/// Wiring of one pipeline generation
pub mod pipeline;

/// Fingerprint and validation history persistence
pub mod store;

/// Lifecycle, health and restart policy
pub mod supervisor;

/// Records flowing between stages
pub mod types;

/// Filesystem watching and root scanning
pub mod watch;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{PipelineError, Result};
