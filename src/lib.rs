//! Orchesity - adaptive orchestration across interchangeable LLM backends
//!
//! This crate routes a logical request to one or more backends, picks them
//! from continuously updated performance metrics, calls them concurrently
//! with failover, and short-circuits repeat work through a response cache
//! with single-flight deduplication.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use orchesity::{Orchesity, OrchestrationRequest, SelectionPolicy};
//! use orchesity::backend::SimulatedBackend;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> orchesity::Result<()> {
//!     let engine = Orchesity::builder()
//!         .backend(Arc::new(SimulatedBackend::new("openai/gpt-4")))
//!         .backend(Arc::new(SimulatedBackend::new("anthropic/claude")))
//!         .policy(SelectionPolicy::LoadBalanced)
//!         .build()?;
//!
//!     let response = engine
//!         .orchestrate(OrchestrationRequest::new("What is the capital of France?"))
//!         .await?;
//!
//!     if let Some(best) = response.primary() {
//!         println!("{}: {}", best.backend, best.text);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Fan-out with partial success
//!
//! ```rust,no_run
//! # use orchesity::{Orchestrator, OrchestrationRequest};
//! # async fn run(engine: &Orchestrator) -> orchesity::Result<()> {
//! let request = OrchestrationRequest::new("Summarise this paragraph")
//!     .backends(["openai/gpt-4", "anthropic/claude", "local/llama"])
//!     .min_success(2)
//!     .deadline(std::time::Duration::from_secs(10));
//! let response = engine.orchestrate(request).await?;
//! for failure in &response.errors {
//!     eprintln!("{} failed: {}", failure.backend, failure.message);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod scoring;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use backend::{Backend, BackendProfile};
pub use cache::{CacheBackend, CacheStats, MemoryCache, RequestFingerprint};
pub use config::EngineConfig;
pub use engine::{
    AuditRecord, AuditSink, BackendStats, Orchesity, OrchesityBuilder, Orchestrator, ProbeReport,
};
pub use error::{OrchesityError, Result};
pub use scoring::{BackendMetrics, ScoringWeights};

// Re-export all types
pub use types::{
    BackendFailure, BackendId, BackendReply, BackendResult, DispatchStatus, ErrorKind,
    GenerationParams, OrchestrationRequest, OrchestrationResponse, ResultSource, SelectionPolicy,
    Usage,
};
