// src/api/mod.rs

//! Shared state handed to every route handler.

pub mod state;
