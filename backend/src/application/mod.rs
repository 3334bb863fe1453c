//! Application layer: port traits and the services built on them.

pub mod ports;
pub mod services;
