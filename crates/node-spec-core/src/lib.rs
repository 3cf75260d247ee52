//! Deterministic rules shared by the node and by anything that verifies its output.
//!
//! Nothing in here performs I/O; every function is a pure function of its inputs.

#![forbid(unsafe_code)]

pub mod clique;
pub mod finality;
pub mod sampling;
pub mod storage_keys;
