//! Testing utilities and mock implementations
//!
//! An in-memory broker and a recording event handler, so the client can be
//! exercised end to end without a network or certificates.

pub mod mocks;

pub use mocks::*;
