//! Per-method analyses: control flow, exception regions and register liveness.

pub mod bitset;
pub mod cfg;
pub mod exceptions;
pub mod liveness;
