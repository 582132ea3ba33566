//! Resumable streaming requests: every entry a run produces is written to a
//! per-request log before it is delivered, so a client that loses its
//! connection can pick up where it left off.

pub mod cancellation;
pub mod cli;
pub mod config;
pub mod controller;
pub mod engine;
pub mod registry;
pub mod restore;
pub mod router;
pub mod service;
pub mod stream_log;
pub mod sweeper;
