//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod convergence;
pub mod metrics;
pub mod scrape;
pub mod spec;
pub mod types;
