//! `jobforge-worker`: built-in job handlers, producer helpers and the worker
//! process entrypoint.

pub mod builtin;
pub mod producer;

pub use builtin::{SimulatedWork, register_builtin};
