//! berth backend library.
//!
//! Launches, tracks and tears down per-user app containers on a container
//! engine, an engine cluster or a container orchestrator, and re-adopts
//! objects left behind by an earlier control-plane process.
//!
//! Layering follows `domain` (pure types) → `application` (port traits and
//! use cases) → `infra` (adapters that perform I/O).

pub mod application;
pub mod domain;
pub mod infra;
