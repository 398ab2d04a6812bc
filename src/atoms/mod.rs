// ── CharHub Atoms ──────────────────────────────────────────────────────────
// Foundational layer: pure data types, the error enum, and named constants.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

pub mod constants;
pub mod error;
pub mod types;
