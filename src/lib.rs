//! COVID-19 statistics for Germany.
//!
//! Daily case and death figures are read from the RKI feature service,
//! folded into a date-indexed table together with derived statistics and
//! served read-only over HTTP. The binary in `main.rs` wires these modules
//! together; tests and benchmarks use them directly.

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
