//! Infrastructure layer: adapters that talk to container substrates and the
//! shared lease store, plus configuration and startup wiring.

pub mod config;
pub mod docker;
pub mod factory;
pub mod kubernetes;
pub mod telemetry;
pub mod valkey;
