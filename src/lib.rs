// CharHub core — real-time credit-metered AI interaction engine.
// Library root: the binary in main.rs wires these layers together, and the
// integration tests drive them directly.

pub mod api;
pub mod atoms;
pub mod engine;
