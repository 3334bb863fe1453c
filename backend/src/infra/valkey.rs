//! Shared port-lease store on Valkey, via `fred`.
//!
//! Leases live in one hash (`berth:ports`, field = port, value = owner).
//! `HSETNX` makes a single claim atomic across processes.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use berth_common::keys;
use fred::prelude::*;

use crate::application::ports::LeaseStore;

/// Drops every field of `KEYS[1]` whose value is `ARGV[1]`.
const RELEASE_OWNER_SCRIPT: &str = r"
local entries = redis.call('HGETALL', KEYS[1])
local released = 0
for i = 1, #entries, 2 do
  if entries[i + 1] == ARGV[1] then
    redis.call('HDEL', KEYS[1], entries[i])
    released = released + 1
  end
end
return released
";

#[derive(Clone)]
pub struct ValkeyLeaseStore {
    client: Client,
}

impl ValkeyLeaseStore {
    pub async fn connect(valkey_url: &str) -> Result<Self> {
        let config = Config::from_url(valkey_url)
            .with_context(|| format!("invalid Valkey URL {valkey_url}"))?;
        let client = Builder::from_config(config)
            .with_connection_config(|conn_config| {
                conn_config.connection_timeout = Duration::from_secs(5);
                conn_config.internal_command_timeout = Duration::from_secs(10);
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 5000, 5))
            .build()?;

        client.init().await.context("cannot connect to Valkey")?;
        client
            .ping::<String>(None)
            .await
            .context("Valkey startup PING failed")?;

        tracing::info!("Valkey port-lease store ready");
        Ok(Self { client })
    }
}

#[async_trait]
impl LeaseStore for ValkeyLeaseStore {
    async fn leases(&self) -> Result<BTreeMap<u16, String>> {
        let raw: HashMap<String, String> = self
            .client
            .hgetall(keys::PORT_LEASES)
            .await
            .context("cannot read port leases")?;
        let mut leases = BTreeMap::new();
        for (port, owner) in raw {
            match port.parse::<u16>() {
                Ok(port) => {
                    leases.insert(port, owner);
                }
                Err(_) => tracing::warn!(field = %port, "ignoring malformed port lease"),
            }
        }
        Ok(leases)
    }

    async fn try_claim(&self, port: u16, owner_id: &str) -> Result<bool> {
        self.client
            .hsetnx::<bool, _, _, _>(keys::PORT_LEASES, port.to_string(), owner_id)
            .await
            .with_context(|| format!("cannot claim port {port}"))
    }

    async fn claim(&self, port: u16, owner_id: &str) -> Result<()> {
        self.client
            .hset::<(), _, _>(keys::PORT_LEASES, (port.to_string(), owner_id))
            .await
            .with_context(|| format!("cannot record port {port}"))
    }

    async fn release_owner(&self, owner_id: &str) -> Result<usize> {
        let released: i64 = self
            .client
            .eval(RELEASE_OWNER_SCRIPT, vec![keys::PORT_LEASES], vec![owner_id])
            .await
            .with_context(|| format!("cannot release ports of {owner_id}"))?;
        Ok(usize::try_from(released).unwrap_or_default())
    }
}
