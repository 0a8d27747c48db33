//! Command surface exposed to front-ends.
//!
//! Versioned modules (currently `v1`) group related commands to keep the
//! interface stable while the implementation moves.

pub mod v1;
