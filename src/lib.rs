//! Tiered Advice Orchestrator
//!
//! Answers a user's financial question with the right language model:
//! - Classifies query complexity from cheap signals (no model call)
//! - Gates models by subscription tier and live monthly quota
//! - Falls back down a cost-ordered cascade instead of failing
//! - Dispatches escalated questions to schema-validated domain analyses
//! - Returns one response contract whichever backend answered
//!
//! FLOW:
//! CONTEXT → ROUTE → RESOLVE MODEL → ORCHESTRATE | CHAT → RECORD USAGE

pub mod advice;
pub mod api;
pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestrators;
pub mod router;
pub mod storage;
pub mod tier;

pub use error::Result;

// Re-export common types
pub use advice::{AdviceOptions, HybridAdviceService};
pub use config::OrchestratorConfig;
pub use models::*;
pub use tier::{AdviceOutcome, AdviceRequest, StreamOutcome, TieredAdviceService};
