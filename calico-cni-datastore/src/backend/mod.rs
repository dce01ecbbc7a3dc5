pub mod etcd;
pub mod kubernetes;
pub mod memory;

use crate::config::{DatastoreConfig, DatastoreType};
use crate::endpoint::WorkloadEndpoint;
use crate::Result;

pub use etcd::EtcdStore;
pub use kubernetes::KubernetesStore;
pub use memory::MemoryStore;

/// Handle to whichever datastore flavour the network config selected.
///
/// Every mutation is conditional: updates carry the resource version they
/// were read at and deletes carry the container ID they expect, so two
/// concurrent plugin invocations for the same pod can never trample each
/// other silently.
pub enum Datastore {
    Etcd(EtcdStore),
    Kubernetes(KubernetesStore),
    Memory(MemoryStore),
}

impl Datastore {
    pub async fn connect(config: &DatastoreConfig) -> Result<Self> {
        match config.datastore_type()? {
            DatastoreType::EtcdV3 => Ok(Datastore::Etcd(EtcdStore::connect(config).await?)),
            DatastoreType::Kubernetes => {
                Ok(Datastore::Kubernetes(KubernetesStore::connect(config).await?))
            }
        }
    }

    pub async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadEndpoint>> {
        match self {
            Datastore::Etcd(s) => s.get_endpoint(namespace, name).await,
            Datastore::Kubernetes(s) => s.get_endpoint(namespace, name).await,
            Datastore::Memory(s) => s.get_endpoint(namespace, name),
        }
    }

    /// All endpoints recorded for a pod, regardless of container ID. Feeds
    /// duplicate detection on ADD.
    pub async fn list_by_pod(&self, namespace: &str, pod: &str) -> Result<Vec<WorkloadEndpoint>> {
        match self {
            Datastore::Etcd(s) => s.list_by_pod(namespace, pod).await,
            Datastore::Kubernetes(s) => s.list_by_pod(namespace, pod).await,
            Datastore::Memory(s) => s.list_by_pod(namespace, pod),
        }
    }

    /// Create when the endpoint carries no resource version, update at that
    /// version otherwise. Returns the stored endpoint with its new version.
    pub async fn create_or_update(&self, wep: &WorkloadEndpoint) -> Result<WorkloadEndpoint> {
        match self {
            Datastore::Etcd(s) => s.create_or_update(wep).await,
            Datastore::Kubernetes(s) => s.create_or_update(wep).await,
            Datastore::Memory(s) => s.create_or_update(wep),
        }
    }

    /// Delete the endpoint only if its stored container ID matches. A
    /// mismatch or an already-absent endpoint is a no-op success, which is
    /// what makes stale DELs from the runtime harmless.
    pub async fn delete_endpoint(
        &self,
        namespace: &str,
        name: &str,
        expected_container_id: &str,
    ) -> Result<bool> {
        match self {
            Datastore::Etcd(s) => s.delete_endpoint(namespace, name, expected_container_id).await,
            Datastore::Kubernetes(s) => {
                s.delete_endpoint(namespace, name, expected_container_id).await
            }
            Datastore::Memory(s) => s.delete_endpoint(namespace, name, expected_container_id),
        }
    }

    /// Idempotently create the permissive profile for a generic CNI network.
    pub async fn ensure_profile(&self, name: &str) -> Result<()> {
        match self {
            Datastore::Etcd(s) => s.ensure_profile(name).await,
            Datastore::Kubernetes(s) => s.ensure_profile(name).await,
            Datastore::Memory(s) => s.ensure_profile(name),
        }
    }
}
