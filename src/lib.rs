//! Library crate for story-session-back, exposing modules for binaries and tests.

pub mod config;
/// Storage entities and backends.
pub mod dao;
/// Request, response and event payloads.
pub mod dto;
/// Service and HTTP error types.
pub mod error;
pub mod narrator;
/// HTTP and SSE routes.
pub mod routes;
/// Coordinator operations behind the routes.
pub mod services;
/// Shared application state and the pure session model.
pub mod state;

#[cfg(test)]
mod test_support;
