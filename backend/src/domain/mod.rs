//! Domain layer: pure types, no I/O.

pub mod error;
pub mod proxy;
pub mod runtime_value;
pub mod spec;
pub mod startup_log;

pub use error::{
    CatalogError, ConfigError, PortAllocationError, ProvisionError, ProxyStartFailure,
    RuntimeValueError, SpecError, StartFailure, StartupLogError, TeardownError,
};
pub use proxy::{
    AuthenticatedUser, Container, ContainerBuilder, ExistingContainerInfo, Proxy, ProxyBuilder,
};
pub use runtime_value::{
    KeyFlags, RuntimeValue, RuntimeValueCatalog, RuntimeValueKey, RuntimeValues, Value, ValueKind,
};
pub use spec::{ContainerSpec, PortMappingSpec, ProxySpec};
pub use startup_log::{ProxyStartupLog, ProxyStartupLogBuilder, StepState};
