//! flowdeck HTTP API server.
//!
//! This crate exposes the flow command service over HTTP and provides the
//! Postgres repositories backing it.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
