//! Deterministic verification engines.
//!
//! Each engine consumes a structured artifact produced by an untrusted
//! translator and verifies it without executing anything: the math engine
//! evaluates a whitelisted expression grammar, the code engine walks a
//! statement model with a security rule catalogue, the SQL engine checks
//! statements against an allow list and a declared schema, and the stats
//! engine runs a chained-call DSL over one CSV-loaded frame.

pub mod code;
pub mod math;
pub mod sql;
pub mod stats;
