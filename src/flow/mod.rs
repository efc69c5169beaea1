//! Flow Definition Module
//!
//! This module provides the core data structures and functions for
//! defining, loading, and validating flows.
//!
//! # Components
//!
//! - [`model`]: Step and flow data structures
//! - [`condition`]: Step gating expressions
//! - [`parser`]: YAML loading and flow lookup by id
//! - [`validator`]: Structural validation

pub mod condition;
pub mod model;
pub mod parser;
pub mod validator;

pub use condition::{Condition, KeyPath};
pub use model::{
    CapabilityKind, FlowDefinition, OnError, RetryPolicy, StepDescriptor, StepKind,
};
pub use parser::{
    load_flow, parse_flow, FlowLocator, DEFAULT_CONFIG_DIR, DEFAULT_FLOW_ID, FLOW_ID_ENV,
};
pub use validator::{
    prepare_flow, validate_environment, validate_flow, ValidationMode, SKIP_ENV_VALIDATION,
};
