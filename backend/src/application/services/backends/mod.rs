//! The closed set of backends, one per substrate.

pub mod cluster;
pub mod engine;
pub mod orchestrator;

pub use cluster::ClusterBackend;
pub use engine::EngineBackend;
pub use orchestrator::OrchestratorBackend;
