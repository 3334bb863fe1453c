pub mod backends;
pub mod lifecycle;
pub mod metadata;
pub mod port_allocator;
pub mod provisioning;
pub mod recovery;
pub mod retry;
