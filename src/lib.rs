pub mod config;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod server;
pub mod sqlite;

// Layered boundaries: ports in app, adapters in infra
pub mod app;
pub mod infra;

// Domain data shapes shared across layers
pub mod domain;
