//! Event buses.
//!
//! - `EventBus`: broadcast of activity lifecycle events to observers.
//! - `CloudEventBus`: ordered, unbounded fan-out of inbound cloud events to
//!   correlation handlers.

pub mod bus;
pub mod cloud;

pub use bus::EventBus;
pub use cloud::{CloudEventBus, CloudEventSubscription};
