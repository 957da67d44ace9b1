//! lcmux - credit-based stream multiplexer
//!
//! This crate multiplexes flow-controlled logical streams over a single
//! reliable byte transport, with explicit credit accounting and graceful
//! per-stream closing.

pub mod mux;
pub mod session;
