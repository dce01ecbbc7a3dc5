use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, GetOptions, Identity, TlsOptions,
    Txn, TxnOp,
};
use tracing::debug;

use crate::config::DatastoreConfig;
use crate::endpoint::WorkloadEndpoint;
use crate::profile::Profile;
use crate::{Error, Result};

const ENDPOINT_PREFIX: &str = "/calico/resources/v3/projectcalico.org/workloadendpoints";
const PROFILE_PREFIX: &str = "/calico/resources/v3/projectcalico.org/profiles";

/// Datastore backend persisting resources as JSON values in etcdv3.
/// A key's mod revision doubles as the resource version; every mutation is a
/// transaction comparing against the revision it was read at.
pub struct EtcdStore {
    client: Client,
}

fn endpoint_key(namespace: &str, name: &str) -> String {
    format!("{ENDPOINT_PREFIX}/{namespace}/{name}")
}

fn namespace_prefix(namespace: &str) -> String {
    format!("{ENDPOINT_PREFIX}/{namespace}/")
}

fn profile_key(name: &str) -> String {
    format!("{PROFILE_PREFIX}/{name}")
}

/// Serialized form never embeds the resource version; it lives in etcd
/// metadata and would go stale inside the value.
fn to_stored_json(wep: &WorkloadEndpoint) -> Result<Vec<u8>> {
    let mut wep = wep.clone();
    wep.metadata.resource_version = None;
    Ok(serde_json::to_vec(&wep)?)
}

fn from_stored_json(value: &[u8], mod_revision: i64) -> Result<WorkloadEndpoint> {
    let mut wep: WorkloadEndpoint = serde_json::from_slice(value)?;
    wep.metadata.resource_version = Some(mod_revision.to_string());
    Ok(wep)
}

impl EtcdStore {
    pub async fn connect(config: &DatastoreConfig) -> Result<Self> {
        let endpoints = config.etcd_endpoint_list()?;
        let mut options = ConnectOptions::new();
        if let Some(tls) = tls_options(config).await? {
            options = options.with_tls(tls);
        }
        let client = Client::connect(&endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    pub async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadEndpoint>> {
        let mut client = self.client.clone();
        let resp = client.get(endpoint_key(namespace, name), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(from_stored_json(kv.value(), kv.mod_revision())?)),
            None => Ok(None),
        }
    }

    pub async fn list_by_pod(&self, namespace: &str, pod: &str) -> Result<Vec<WorkloadEndpoint>> {
        let mut client = self.client.clone();
        let resp = client
            .get(namespace_prefix(namespace), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut endpoints = Vec::new();
        for kv in resp.kvs() {
            let wep = from_stored_json(kv.value(), kv.mod_revision())?;
            if wep.spec.pod == pod {
                endpoints.push(wep);
            }
        }
        Ok(endpoints)
    }

    pub async fn create_or_update(&self, wep: &WorkloadEndpoint) -> Result<WorkloadEndpoint> {
        let key = endpoint_key(wep.namespace(), wep.name());
        let value = to_stored_json(wep)?;

        let compare = match wep.resource_version() {
            None => Compare::create_revision(key.clone(), CompareOp::Equal, 0),
            Some(rv) => {
                let revision: i64 = rv.parse().map_err(|_| {
                    Error::InvalidConfig(format!("malformed resource version {rv:?}"))
                })?;
                Compare::mod_revision(key.clone(), CompareOp::Equal, revision)
            }
        };

        let txn = Txn::new()
            .when([compare])
            .and_then([TxnOp::put(key.clone(), value, None)]);
        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(Error::Conflict {
                namespace: wep.namespace().to_owned(),
                name: wep.name().to_owned(),
            });
        }

        // Re-read for the new mod revision.
        let stored = self.get_endpoint(wep.namespace(), wep.name()).await?;
        stored.ok_or_else(|| Error::Conflict {
            namespace: wep.namespace().to_owned(),
            name: wep.name().to_owned(),
        })
    }

    pub async fn delete_endpoint(
        &self,
        namespace: &str,
        name: &str,
        expected_container_id: &str,
    ) -> Result<bool> {
        let key = endpoint_key(namespace, name);
        for _ in 0..3 {
            let Some(existing) = self.get_endpoint(namespace, name).await? else {
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
            let revision: i64 = existing
                .resource_version()
                .unwrap_or("0")
                .parse()
                .unwrap_or(0);
            let txn = Txn::new()
                .when([Compare::mod_revision(key.clone(), CompareOp::Equal, revision)])
                .and_then([TxnOp::delete(key.clone(), None)]);
            let mut client = self.client.clone();
            if client.txn(txn).await?.succeeded() {
                return Ok(true);
            }
            // Lost the race against another writer, re-read and retry.
        }
        Err(Error::Conflict {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
    }

    pub async fn ensure_profile(&self, name: &str) -> Result<()> {
        let key = profile_key(name);
        let value = serde_json::to_vec(&Profile::default_allow(name))?;
        let txn = Txn::new()
            .when([Compare::create_revision(key.clone(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, None)]);
        let mut client = self.client.clone();
        // A failed compare just means the profile already exists.
        client.txn(txn).await?;
        Ok(())
    }
}

async fn tls_options(config: &DatastoreConfig) -> Result<Option<TlsOptions>> {
    let needs_tls = config.etcd_ca_cert_file.is_some()
        || (config.etcd_cert_file.is_some() && config.etcd_key_file.is_some());
    if !needs_tls {
        return Ok(None);
    }

    let mut tls = TlsOptions::new();
    if let Some(ca) = &config.etcd_ca_cert_file {
        let pem = tokio::fs::read(ca).await?;
        tls = tls.ca_certificate(Certificate::from_pem(pem));
    }
    if let (Some(cert), Some(key)) = (&config.etcd_cert_file, &config.etcd_key_file) {
        let cert_pem = tokio::fs::read(cert).await?;
        let key_pem = tokio::fs::read(key).await?;
        tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
    }
    Ok(Some(tls))
}
