//! Workflow execution and event correlation engine for Synapse.
//!
//! This crate defines the "ports" (repository, schema handler, external
//! resource provider, function invoker traits) that the infrastructure layer
//! implements, plus everything that runs on top of them: the workflow
//! runtime and its activity processors, the correlation engine and the
//! controllers that claim and drive resources. It depends only on
//! `synapse-types` -- never on `synapse-infra` or any database/IO crate.

pub mod controller;
pub mod correlation;
pub mod definition;
pub mod event;
pub mod expression;
pub mod external;
pub mod repository;
pub mod runtime;
pub mod schema;
