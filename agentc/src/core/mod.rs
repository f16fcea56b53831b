//! Deterministic, pure logic shared by the compiler and runtime.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod cancel;
pub mod embed;
pub mod invariants;
pub mod lifecycle;
pub mod platform;
pub mod spec;
pub mod template;
