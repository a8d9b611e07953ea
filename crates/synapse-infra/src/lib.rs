//! Infrastructure layer for Synapse.
//!
//! Implements the ports defined in `synapse-core`: SQLite resource storage,
//! HTTP / OpenAPI / OData function invokers with OAuth2 token caching,
//! JSON Schema validation, file and HTTP external resource providers, and
//! configuration loading.

pub mod config;
pub mod external;
pub mod function;
pub mod schema;
pub mod sqlite;
