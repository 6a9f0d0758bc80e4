//! HTTP transport adapter in front of the command bus.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
