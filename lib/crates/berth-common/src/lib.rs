pub mod config;
pub mod store_keys;
pub mod types;

pub use config::{
    BackendSelection, DockerEngineConfig, DockerSwarmConfig, KubernetesConfig, PortStoreConfig,
    PortStoreKind,
};
pub use store_keys::{keys, validate_owner_id};
pub use types::*;
