//! Read-only cluster queries.
//!
//! Every query loads whole collections from the store, so it sees a committed
//! state from before or after any concurrent mutation, never a partial one.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{ClusterError, Result};
use crate::model::{Cluster, Decision, DistributionRecord, Purchase};
use crate::store::{self, Store};

#[derive(Clone)]
pub struct ClusterRegistry {
    store: Arc<dyn Store>,
}

impl ClusterRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn get_cluster_by_id(&self, cluster_id: &str) -> Result<Cluster> {
        let record = self
            .store
            .load(store::CLUSTERS)?
            .into_iter()
            .find(|r| field(r, "id") == Some(cluster_id))
            .ok_or_else(|| ClusterError::NotFound(format!("cluster {}", cluster_id)))?;
        decode(record)
    }

    pub fn all_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(store::load_typed(self.store.as_ref(), store::CLUSTERS)?)
    }

    /// Clusters whose region matches, ignoring ASCII case
    pub fn clusters_by_region(&self, region: &str) -> Result<Vec<Cluster>> {
        let region = region.trim();
        Ok(self
            .all_clusters()?
            .into_iter()
            .filter(|c| c.location.region.eq_ignore_ascii_case(region))
            .collect())
    }

    /// Clusters in which `user_id` is an active member
    pub fn clusters_by_member(&self, user_id: &str) -> Result<Vec<Cluster>> {
        Ok(self
            .all_clusters()?
            .into_iter()
            .filter(|c| c.member(user_id).map_or(false, |m| m.is_active))
            .collect())
    }

    pub fn decisions_for(&self, cluster_id: &str) -> Result<Vec<Decision>> {
        self.records_for(store::DECISIONS, cluster_id)
    }

    pub fn get_decision(&self, cluster_id: &str, decision_id: &str) -> Result<Decision> {
        self.decisions_for(cluster_id)?
            .into_iter()
            .find(|d| d.id == decision_id)
            .ok_or_else(|| ClusterError::NotFound(format!("decision {}", decision_id)))
    }

    pub fn purchases_for(&self, cluster_id: &str) -> Result<Vec<Purchase>> {
        self.records_for(store::PURCHASES, cluster_id)
    }

    /// Distribution cycles in the order they ran
    pub fn distribution_history(&self, cluster_id: &str) -> Result<Vec<DistributionRecord>> {
        self.records_for(store::DISTRIBUTIONS, cluster_id)
    }

    fn records_for<T: DeserializeOwned>(&self, collection: &str, cluster_id: &str) -> Result<Vec<T>> {
        self.store
            .load(collection)?
            .into_iter()
            .filter(|r| field(r, "cluster_id") == Some(cluster_id))
            .map(decode)
            .collect()
    }
}

pub(crate) fn field<'a>(record: &'a Value, name: &str) -> Option<&'a str> {
    record.get(name).and_then(Value::as_str)
}

pub(crate) fn decode<T: DeserializeOwned>(record: Value) -> Result<T> {
    serde_json::from_value(record)
        .map_err(|e| ClusterError::Store(crate::error::StoreError::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::tests::founded;
    use crate::store::{to_records, MemoryStore};

    fn registry_with(clusters: &[Cluster]) -> ClusterRegistry {
        let backend = Arc::new(MemoryStore::new());
        backend
            .save(store::CLUSTERS, to_records(clusters).unwrap())
            .unwrap();
        ClusterRegistry::new(backend)
    }

    fn cluster(id: &str, region: &str) -> Cluster {
        let mut c = founded(1000);
        c.id = id.into();
        c.location.region = region.into();
        c
    }

    #[test]
    fn test_get_cluster_by_id_is_idempotent() {
        let registry = registry_with(&[cluster("c1", "nairobi"), cluster("c2", "mombasa")]);
        let first = registry.get_cluster_by_id("c2").unwrap();
        let second = registry.get_cluster_by_id("c2").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.location.region, "mombasa");
    }

    #[test]
    fn test_missing_cluster() {
        let registry = registry_with(&[]);
        assert!(matches!(
            registry.get_cluster_by_id("nope"),
            Err(ClusterError::NotFound(_))
        ));
    }

    #[test]
    fn test_by_region_and_member() {
        let mut c3 = cluster("c3", "Nairobi");
        c3.members[0].user_id = "someone_else".into();
        let registry = registry_with(&[cluster("c1", "nairobi"), cluster("c2", "mombasa"), c3]);

        let nairobi: Vec<String> = registry
            .clusters_by_region("NAIROBI")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(nairobi, vec!["c1", "c3"]);

        let mine = registry.clusters_by_member("founder").unwrap();
        assert_eq!(mine.len(), 2);
        assert!(registry.clusters_by_member("ghost").unwrap().is_empty());
    }

    #[test]
    fn test_empty_histories() {
        let registry = registry_with(&[cluster("c1", "nairobi")]);
        assert!(registry.decisions_for("c1").unwrap().is_empty());
        assert!(registry.purchases_for("c1").unwrap().is_empty());
        assert!(registry.distribution_history("c1").unwrap().is_empty());
        assert!(matches!(
            registry.get_decision("c1", "d1"),
            Err(ClusterError::NotFound(_))
        ));
    }
}
