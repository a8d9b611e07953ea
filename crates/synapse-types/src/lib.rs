//! Shared domain types for Synapse.
//!
//! Resources (workflows, workflow instances, correlations), the workflow
//! definition model, activity and instance lifecycles, cloud events, errors
//! and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, semver, thiserror.

pub mod activity;
pub mod config;
pub mod correlation;
pub mod error;
pub mod event;
pub mod instance;
pub mod resource;
pub mod workflow;
