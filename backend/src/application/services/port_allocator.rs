//! Host-port allocators.
//!
//! [`MemoryPortAllocator`] serves a single control-plane process.
//! [`StorePortAllocator`] shares leases between cooperating processes through
//! a [`LeaseStore`] whose `try_claim` is atomic per port, so two processes
//! can never both win the same port.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use berth_common::validate_owner_id;
use tokio::sync::Mutex;

use crate::application::ports::{LeaseStore, PortAllocator};
use crate::domain::PortAllocationError;

fn check_owner(owner_id: &str) -> Result<(), PortAllocationError> {
    validate_owner_id(owner_id).map_err(|reason| PortAllocationError::InvalidOwner {
        owner: owner_id.to_string(),
        reason,
    })
}

fn check_range(start: u16, end: u16) -> Result<(), PortAllocationError> {
    if start == 0 || start > end {
        return Err(PortAllocationError::InvalidRange { start, end });
    }
    Ok(())
}

fn lowest_free(leases: &BTreeMap<u16, String>, start: u16, end: u16) -> Option<u16> {
    (start..=end).find(|port| !leases.contains_key(port))
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryPortAllocator {
    leases: Mutex<BTreeMap<u16, String>>,
}

impl MemoryPortAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PortAllocator for MemoryPortAllocator {
    async fn allocate(
        &self,
        range_start: u16,
        range_end: u16,
        owner_id: &str,
    ) -> Result<u16, PortAllocationError> {
        check_owner(owner_id)?;
        check_range(range_start, range_end)?;
        let mut leases = self.leases.lock().await;
        let port = lowest_free(&leases, range_start, range_end).ok_or(
            PortAllocationError::Exhausted {
                start: range_start,
                end: range_end,
            },
        )?;
        leases.insert(port, owner_id.to_string());
        Ok(port)
    }

    async fn release(&self, owner_id: &str) -> Result<(), PortAllocationError> {
        let mut leases = self.leases.lock().await;
        leases.retain(|_, owner| owner != owner_id);
        Ok(())
    }

    async fn add_existing_port(
        &self,
        owner_id: &str,
        port: u16,
    ) -> Result<(), PortAllocationError> {
        check_owner(owner_id)?;
        let mut leases = self.leases.lock().await;
        match leases.get(&port) {
            Some(holder) if holder != owner_id => Err(PortAllocationError::Conflict {
                port,
                holder: holder.clone(),
            }),
            _ => {
                leases.insert(port, owner_id.to_string());
                Ok(())
            }
        }
    }

    async fn owned_ports(&self, owner_id: &str) -> Result<BTreeSet<u16>, PortAllocationError> {
        let leases = self.leases.lock().await;
        Ok(leases
            .iter()
            .filter(|(_, owner)| owner.as_str() == owner_id)
            .map(|(port, _)| *port)
            .collect())
    }
}

// ── Shared store ──────────────────────────────────────────────────────────────

pub struct StorePortAllocator<S> {
    store: S,
}

impl<S: LeaseStore> StorePortAllocator<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: LeaseStore> PortAllocator for StorePortAllocator<S> {
    async fn allocate(
        &self,
        range_start: u16,
        range_end: u16,
        owner_id: &str,
    ) -> Result<u16, PortAllocationError> {
        check_owner(owner_id)?;
        check_range(range_start, range_end)?;
        let exhausted = PortAllocationError::Exhausted {
            start: range_start,
            end: range_end,
        };
        // Each lost race means another process took a port, so the number
        // of rounds is bounded by the range size.
        for _ in range_start..=range_end {
            let leases = self.store.leases().await.map_err(PortAllocationError::Store)?;
            let Some(port) = lowest_free(&leases, range_start, range_end) else {
                return Err(exhausted);
            };
            if self
                .store
                .try_claim(port, owner_id)
                .await
                .map_err(PortAllocationError::Store)?
            {
                return Ok(port);
            }
            tracing::debug!(port, owner_id, "lost port claim race, retrying");
        }
        Err(exhausted)
    }

    async fn release(&self, owner_id: &str) -> Result<(), PortAllocationError> {
        let released = self
            .store
            .release_owner(owner_id)
            .await
            .map_err(PortAllocationError::Store)?;
        if released > 0 {
            tracing::debug!(owner_id, released, "released port leases");
        }
        Ok(())
    }

    async fn add_existing_port(
        &self,
        owner_id: &str,
        port: u16,
    ) -> Result<(), PortAllocationError> {
        check_owner(owner_id)?;
        if self
            .store
            .try_claim(port, owner_id)
            .await
            .map_err(PortAllocationError::Store)?
        {
            return Ok(());
        }
        let leases = self.store.leases().await.map_err(PortAllocationError::Store)?;
        match leases.get(&port) {
            Some(holder) if holder != owner_id => Err(PortAllocationError::Conflict {
                port,
                holder: holder.clone(),
            }),
            Some(_) => Ok(()),
            None => self
                .store
                .claim(port, owner_id)
                .await
                .map_err(PortAllocationError::Store),
        }
    }

    async fn owned_ports(&self, owner_id: &str) -> Result<BTreeSet<u16>, PortAllocationError> {
        let leases = self.store.leases().await.map_err(PortAllocationError::Store)?;
        Ok(leases
            .into_iter()
            .filter(|(_, owner)| owner == owner_id)
            .map(|(port, _)| port)
            .collect())
    }
}
