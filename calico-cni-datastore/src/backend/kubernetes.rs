use kube::api::{Api, DeleteParams, ListParams, Preconditions, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::{debug, warn};

use crate::config::DatastoreConfig;
use crate::endpoint::{WorkloadEndpoint, LABEL_ORCHESTRATOR, ORCHESTRATOR_K8S};
use crate::profile::Profile;
use crate::{Error, Result};

/// Datastore backend storing endpoints and profiles as custom resources in
/// the Kubernetes API. Optimistic concurrency rides on the API server's
/// resourceVersion handling.
pub struct KubernetesStore {
    client: kube::Client,
}

impl KubernetesStore {
    pub async fn connect(config: &DatastoreConfig) -> Result<Self> {
        Ok(Self {
            client: client(config).await?,
        })
    }

    pub fn from_client(client: kube::Client) -> Self {
        Self { client }
    }

    fn endpoints(&self, namespace: &str) -> Api<WorkloadEndpoint> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadEndpoint>> {
        Ok(self.endpoints(namespace).get_opt(name).await?)
    }

    pub async fn list_by_pod(&self, namespace: &str, pod: &str) -> Result<Vec<WorkloadEndpoint>> {
        let params =
            ListParams::default().labels(&format!("{LABEL_ORCHESTRATOR}={ORCHESTRATOR_K8S}"));
        let list = self.endpoints(namespace).list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|wep| wep.spec.pod == pod)
            .collect())
    }

    pub async fn create_or_update(&self, wep: &WorkloadEndpoint) -> Result<WorkloadEndpoint> {
        let api = self.endpoints(wep.namespace());
        let stored = if wep.resource_version().is_none() {
            api.create(&PostParams::default(), wep).await?
        } else {
            api.replace(wep.name(), &PostParams::default(), wep).await?
        };
        Ok(stored)
    }

    pub async fn delete_endpoint(
        &self,
        namespace: &str,
        name: &str,
        expected_container_id: &str,
    ) -> Result<bool> {
        let api = self.endpoints(namespace);
        for _ in 0..3 {
            let Some(existing) = api.get_opt(name).await? else {
                return Ok(false);
            };
            if existing.spec.container_id != expected_container_id {
                debug!(
                    name,
                    stored = %existing.spec.container_id,
                    expected = %expected_container_id,
                    "endpoint owned by another container, leaving in place"
                );
                return Ok(false);
            }
            let params = DeleteParams {
                preconditions: Some(Preconditions {
                    resource_version: existing.metadata.resource_version.clone(),
                    uid: existing.metadata.uid.clone(),
                }),
                ..Default::default()
            };
            match api.delete(name, &params).await {
                Ok(_) => return Ok(true),
                Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(false),
                // Lost the race against another writer, re-read and retry.
                Err(kube::Error::Api(resp)) if resp.code == 409 => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
    }

    pub async fn ensure_profile(&self, name: &str) -> Result<()> {
        let api: Api<Profile> = Api::all(self.client.clone());
        match api
            .create(&PostParams::default(), &Profile::default_allow(name))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Build a Kubernetes client from the explicit config; also used by the
/// plugin to read pod metadata when the datastore itself is etcd.
pub async fn client(config: &DatastoreConfig) -> Result<kube::Client> {
    let mut client_config = if let Some(path) = &config.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| Error::InvalidConfig(format!("failed to read kubeconfig {path}: {e}")))?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::InvalidConfig(format!("invalid kubeconfig {path}: {e}")))?
    } else {
        match kube::Config::incluster() {
            Ok(config) => config,
            Err(e) => {
                warn!(%e, "not running in-cluster, inferring kube config");
                kube::Config::infer()
                    .await
                    .map_err(|e| Error::InvalidConfig(format!("failed to infer kube config: {e}")))?
            }
        }
    };

    if let Some(api_root) = &config.k8s_api_root {
        client_config.cluster_url = api_root
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid k8s_api_root {api_root}: {e}")))?;
    }
    if let Some(token) = &config.k8s_auth_token {
        client_config.auth_info.token = Some(token.clone().into());
    }

    Ok(kube::Client::try_from(client_config)?)
}
