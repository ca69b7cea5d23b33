//! WebSocket broadcast relay library.
//! This crate exposes its modules for integration testing.
//! The binary entry point is in main.rs.

pub mod api;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
