//! Expect-style provisioning over a target's serial console.
//!
//! A [`ProvisionScript`] is an ordered list of send / expect / capture steps
//! parsed from the panel file. [`ProvisioningEngine`] runs it against a
//! [`LineDevice`](crate::device::LineDevice), filtering firmware noise through
//! a [`ResponseAccumulator`] and threading captured values forward through a
//! [`VariableContext`].

pub mod accumulator;
pub mod engine;
pub mod models;
pub mod variables;

pub use accumulator::{ResponseAccumulator, SearchMatch, MAX_BUFFER_SIZE, MAX_LINE_SIZE};
pub use engine::{ProvisioningEngine, POLL_INTERVAL};
pub use models::{
    OnFail, ProvisionResult, ProvisionScript, ProvisionStep, ResolvedStep, ScriptIssue, StepResult,
};
pub use variables::{
    extract_variable_names, substitute, system_variables, validate_variables, VariableContext,
    Variables,
};
