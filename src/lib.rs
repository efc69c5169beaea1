//! MedFlow - Declarative Clinical Pipeline Orchestration
//!
//! An engine for running multi-model "second opinion" pipelines described
//! declaratively in YAML: triage, retrieval, independent specialist
//! opinions in parallel, a divergence check and conditional arbitration.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`flow`]: Data structures, conditions, parsing and validation of flow definitions
//! - [`execution`]: Flow engine, step executor, Context Store and capability boundary
//! - [`monitoring`]: Per-run execution timeline
//! - [`error`]: Error taxonomy
//!
//! # Example
//!
//! ```rust,no_run
//! use medflow::execution::{CapabilityRegistry, FlowEngine};
//! use medflow::flow::{FlowLocator, ValidationMode};
//! use serde_json::json;
//!
//! # async fn demo(registry: CapabilityRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! // Load the default flow from config/orchestrations
//! let flow = FlowLocator::default().load(None, ValidationMode::from_env())?;
//!
//! // Bind it to the registered agents and tools
//! let engine = FlowEngine::new(flow, registry)?;
//!
//! // Run it on a case
//! let result = engine.run(json!({"case": "55-year-old with chest pain"})).await;
//! println!("{:?} (outcome: {:?})", result.status, result.outcome);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod execution;
pub mod flow;
pub mod monitoring;

// Re-export commonly used types
pub use error::{CapabilityError, ConfigError, LoadError, StepError};
pub use execution::{CapabilityRegistry, ContextStore, FlowEngine, RunResult, RunStatus};
pub use flow::{load_flow, FlowDefinition, StepDescriptor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "MedFlow";
