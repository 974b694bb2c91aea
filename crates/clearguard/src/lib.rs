//! ClearGuard: real-time explicit-content filtering engine.
//!
//! Wires the policy store, tunnel relay, DNS proxy, screen sampler and
//! blocking coordinator together behind one master enable/disable switch.

pub mod engine;
pub mod platform;

pub use engine::{EngineConfig, EngineError, FilterEngine, HostSeams};
