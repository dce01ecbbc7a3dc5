use std::env;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatastoreType {
    EtcdV3,
    Kubernetes,
}

impl DatastoreType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "etcdv3" => Ok(DatastoreType::EtcdV3),
            "kubernetes" => Ok(DatastoreType::Kubernetes),
            other => Err(Error::InvalidConfig(format!(
                "unknown datastore_type {other:?}, expected \"etcdv3\" or \"kubernetes\""
            ))),
        }
    }
}

/// Connection settings for the datastore, assembled explicitly from the
/// network config rather than exported into the process environment. The
/// ambient `ETCD_*`/`KUBECONFIG`/... variables are still honoured, but only
/// as fallback values read in one place here.
#[derive(Clone, Debug, Default)]
pub struct DatastoreConfig {
    pub datastore_type: Option<String>,

    pub etcd_endpoints: Option<String>,
    pub etcd_authority: Option<String>,
    pub etcd_scheme: Option<String>,
    pub etcd_key_file: Option<String>,
    pub etcd_cert_file: Option<String>,
    pub etcd_ca_cert_file: Option<String>,

    pub kubeconfig: Option<String>,
    pub k8s_api_root: Option<String>,
    pub k8s_auth_token: Option<String>,
}

impl DatastoreConfig {
    /// Fill unset fields from the conventional environment variables.
    pub fn with_env_fallback(mut self) -> Self {
        let fill = |field: &mut Option<String>, var: &str| {
            if field.is_none() {
                if let Ok(v) = env::var(var) {
                    if !v.is_empty() {
                        *field = Some(v);
                    }
                }
            }
        };
        fill(&mut self.datastore_type, "DATASTORE_TYPE");
        fill(&mut self.etcd_endpoints, "ETCD_ENDPOINTS");
        fill(&mut self.etcd_authority, "ETCD_AUTHORITY");
        fill(&mut self.etcd_scheme, "ETCD_SCHEME");
        fill(&mut self.etcd_key_file, "ETCD_KEY_FILE");
        fill(&mut self.etcd_cert_file, "ETCD_CERT_FILE");
        fill(&mut self.etcd_ca_cert_file, "ETCD_CA_CERT_FILE");
        fill(&mut self.kubeconfig, "KUBECONFIG");
        fill(&mut self.k8s_api_root, "K8S_API_ENDPOINT");
        fill(&mut self.k8s_auth_token, "K8S_API_TOKEN");
        self
    }

    pub fn datastore_type(&self) -> Result<DatastoreType> {
        match self.datastore_type.as_deref() {
            Some(s) => DatastoreType::parse(s),
            // etcdv3 is the historical default when nothing is configured.
            None => Ok(DatastoreType::EtcdV3),
        }
    }

    /// The endpoint list for etcd, derived from `etcd_endpoints` or the
    /// legacy authority/scheme pair.
    pub fn etcd_endpoint_list(&self) -> Result<Vec<String>> {
        if let Some(endpoints) = &self.etcd_endpoints {
            return Ok(endpoints
                .split(',')
                .map(|e| e.trim().to_owned())
                .filter(|e| !e.is_empty())
                .collect());
        }
        if let Some(authority) = &self.etcd_authority {
            let scheme = self.etcd_scheme.as_deref().unwrap_or("http");
            return Ok(vec![format!("{scheme}://{authority}")]);
        }
        Err(Error::InvalidConfig(
            "etcdv3 datastore requires etcd_endpoints or etcd_authority".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_type_parses() {
        assert_eq!(
            DatastoreType::parse("etcdv3").unwrap(),
            DatastoreType::EtcdV3
        );
        assert_eq!(
            DatastoreType::parse("kubernetes").unwrap(),
            DatastoreType::Kubernetes
        );
        assert!(DatastoreType::parse("etcdv2").is_err());
    }

    #[test]
    fn endpoint_list_prefers_endpoints_over_authority() {
        let config = DatastoreConfig {
            etcd_endpoints: Some("https://a:2379, https://b:2379".into()),
            etcd_authority: Some("ignored:2379".into()),
            ..Default::default()
        };
        assert_eq!(
            config.etcd_endpoint_list().unwrap(),
            vec!["https://a:2379".to_owned(), "https://b:2379".to_owned()]
        );
    }

    #[test]
    fn endpoint_list_builds_from_authority_and_scheme() {
        let config = DatastoreConfig {
            etcd_authority: Some("127.0.0.1:2379".into()),
            etcd_scheme: Some("https".into()),
            ..Default::default()
        };
        assert_eq!(
            config.etcd_endpoint_list().unwrap(),
            vec!["https://127.0.0.1:2379".to_owned()]
        );
    }

    #[test]
    fn missing_etcd_config_is_an_error() {
        assert!(DatastoreConfig::default().etcd_endpoint_list().is_err());
    }
}
