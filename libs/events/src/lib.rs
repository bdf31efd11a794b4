//! # beacon-events
//!
//! Message bus payload definitions for the beacon router.
//!
//! ## Design Principles
//!
//! - Payloads are plain JSON documents published by backend instances
//! - Every field a publisher may omit has a serde default
//! - Decoding validates the minimum a registration needs to be routable
//!
//! ## Subjects
//!
//! - `router.register` / `router.unregister` carry a [`RegistryMessage`]
//! - `router.greet` is a request answered with a [`RouterGreeting`]
//! - `router.start` announces a [`RouterGreeting`] when a router boots

mod error;
mod types;

pub use error::EventError;
pub use types::*;
