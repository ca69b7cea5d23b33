// src/services/mod.rs

//! # Services Module
//!
//! The relay core: connection registry, per-connection sessions and the
//! bounded message history.

// Live connection set, fan-out and shutdown
pub mod connection_manager;
// Bounded replay buffer for late joiners
pub mod history;
// Per-connection lifecycle
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
