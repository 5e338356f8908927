//! Network fabric joining cluster nodes under aliases

use super::config::{InternalAddress, ServiceEndpoint, Vantage};
use crate::container::ContainerRuntime;
use crate::error::{FlotillaError, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Virtual network shared by the nodes of one cluster
#[derive(Debug)]
pub struct NetworkFabric {
    /// Network name
    name: String,
    /// Alias to node name
    members: RwLock<BTreeMap<String, String>>,
    /// Runtime network id, once created
    network_id: RwLock<Option<String>>,
}

impl NetworkFabric {
    /// Create a fabric with a fixed network name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: RwLock::new(BTreeMap::new()),
            network_id: RwLock::new(None),
        }
    }

    /// Create a fabric with a unique name under `prefix`
    pub fn generated(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().to_string().replace("-", "")[..12].to_string();
        Self::new(&format!("{}-{}", prefix, suffix))
    }

    /// Network name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `node` under `alias`
    ///
    /// Returns whether the alias was newly registered. Re-attaching a node
    /// under an alias it already holds is a no-op returning `false`.
    pub fn attach(&self, alias: &str, node: &str) -> Result<bool> {
        if alias.is_empty() {
            return Err(FlotillaError::InvalidConfig(format!(
                "Empty alias for node {}",
                node
            )));
        }

        let mut members = self.members.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;

        match members.get(alias) {
            Some(owner) if owner == node => return Ok(false),
            Some(_) => {
                return Err(FlotillaError::AliasConflict {
                    alias: alias.to_string(),
                    fabric: self.name.clone(),
                })
            }
            None => {}
        }

        members.insert(alias.to_string(), node.to_string());
        debug!("Attached {} to {} as {}", node, self.name, alias);

        Ok(true)
    }

    /// Release an alias
    pub fn detach(&self, alias: &str) -> Result<Option<String>> {
        let mut members = self.members.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;

        Ok(members.remove(alias))
    }

    /// Node registered under `alias`
    pub fn member(&self, alias: &str) -> Result<Option<String>> {
        let members = self.members.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(members.get(alias).cloned())
    }

    /// All aliases and the nodes they belong to
    pub fn members(&self) -> Result<BTreeMap<String, String>> {
        let members = self.members.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(members.clone())
    }

    /// Fabric-internal address for a member alias
    pub fn internal_address(&self, alias: &str, port: u16) -> Result<InternalAddress> {
        if self.member(alias)?.is_none() {
            return Err(FlotillaError::InvalidConfig(format!(
                "Alias {} is not attached to network {}",
                alias, self.name
            )));
        }

        Ok(InternalAddress {
            alias: alias.to_string(),
            port,
        })
    }

    /// Address of `endpoint` from the given vantage point
    pub fn resolve(&self, endpoint: &ServiceEndpoint, vantage: Vantage) -> Result<String> {
        match vantage {
            Vantage::Fabric => Ok(self
                .internal_address(&endpoint.internal.alias, endpoint.internal.port)?
                .to_string()),
            Vantage::Host => Ok(endpoint.external.to_string()),
        }
    }

    /// Runtime network id, if the network exists
    pub fn network_id(&self) -> Result<Option<String>> {
        let id = self.network_id.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(id.clone())
    }

    /// Create the runtime network, labelled with `session`, if it does not exist yet
    ///
    /// Returns the network id and whether this call created it.
    pub async fn ensure_created(
        &self,
        runtime: &dyn ContainerRuntime,
        session: &str,
    ) -> Result<(String, bool)> {
        if let Some(id) = self.network_id()? {
            return Ok((id, false));
        }

        let id = runtime.create_network(&self.name, session).await?;
        info!("Created network {} ({})", self.name, id);

        let mut slot = self.network_id.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;
        *slot = Some(id.clone());

        Ok((id, true))
    }

    /// Remove the runtime network
    pub async fn remove(&self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let id = {
            let mut slot = self.network_id.write()
                .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;
            slot.take()
        };

        if let Some(id) = id {
            runtime.remove_network(&id).await?;
            info!("Removed network {}", self.name);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::SimulatedRuntime;
    use crate::network::config::ExternalAddress;
    use chrono::Utc;

    #[test]
    fn test_alias_conflict_leaves_fabric_unchanged() {
        let fabric = NetworkFabric::new("test-net");
        fabric.attach("kafka", "broker").unwrap();

        let before = fabric.members().unwrap();
        let err = fabric.attach("kafka", "other").unwrap_err();

        assert!(matches!(err, FlotillaError::AliasConflict { ref alias, .. } if alias == "kafka"));
        assert_eq!(fabric.members().unwrap(), before);
        assert_eq!(fabric.member("kafka").unwrap(), Some("broker".to_string()));
    }

    #[test]
    fn test_reattach_same_node_is_noop() {
        let fabric = NetworkFabric::new("test-net");
        assert!(fabric.attach("kafka", "broker").unwrap());
        assert!(!fabric.attach("kafka", "broker").unwrap());
        assert_eq!(fabric.members().unwrap().len(), 1);

        assert_eq!(fabric.detach("kafka").unwrap(), Some("broker".to_string()));
        assert!(fabric.members().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_internal_and_external() {
        let fabric = NetworkFabric::generated("flotilla");
        assert!(fabric.name().starts_with("flotilla-"));

        let endpoint = ServiceEndpoint {
            name: "broker".to_string(),
            internal: InternalAddress {
                alias: "kafka".to_string(),
                port: 9092,
            },
            external: ExternalAddress {
                host: "localhost".to_string(),
                port: 49153,
            },
            ports: Default::default(),
            ready: true,
            container_id: "c1".to_string(),
            started_at: Utc::now(),
        };

        assert!(fabric.resolve(&endpoint, Vantage::Fabric).is_err());

        fabric.attach("kafka", "broker").unwrap();
        assert_eq!(fabric.resolve(&endpoint, Vantage::Fabric).unwrap(), "kafka:9092");
        assert_eq!(fabric.resolve(&endpoint, Vantage::Host).unwrap(), "localhost:49153");
    }

    #[tokio::test]
    async fn test_network_created_once() {
        let runtime = SimulatedRuntime::new();
        let fabric = NetworkFabric::new("test-net");

        let (id, created) = fabric.ensure_created(&runtime, "s1").await.unwrap();
        assert!(created);
        assert_eq!(runtime.network_session("test-net").unwrap().as_deref(), Some("s1"));
        let (again, created) = fabric.ensure_created(&runtime, "s2").await.unwrap();
        assert!(!created);
        assert_eq!(id, again);

        fabric.remove(&runtime).await.unwrap();
        assert_eq!(fabric.network_id().unwrap(), None);
        assert_eq!(runtime.network_count().unwrap(), 0);
    }
}
