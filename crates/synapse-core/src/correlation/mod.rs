//! Event correlation engine.
//!
//! - `matcher`: filter and key matching, context accumulation.
//! - `handler`: one running handler per claimed correlation, consuming the
//!   cloud event bus and firing outcomes.

pub mod handler;
pub mod matcher;

pub use handler::{
    CorrelationError, CorrelationHandler, CorrelationServices, EventDisposition, MAX_COMPLETED_CONTEXTS,
};
pub use matcher::CorrelationMatcher;
