use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{Error, Result, CNI_VERSION};

/// The network config and the raw JSON it was parsed from. Delegate stdin
/// rewrites operate on the raw value so fields this plugin does not model
/// survive the round trip.
#[derive(Clone, Debug)]
pub struct Input {
    pub conf: NetConf,
    pub raw: Value,
}

impl Input {
    pub fn from_json(buf: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(buf)?;
        let conf = NetConf::deserialize(raw.clone())?;
        Ok(Self { conf, raw })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(
        rename = "cniVersion",
        default = "default_cni_version",
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "deserialize_cni_version"
    )]
    pub cni_version: Version,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub r#type: String,

    #[serde(default)]
    pub ipam: IpamConf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_endpoints: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_authority: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_scheme: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_key_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_cert_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_ca_cert_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyConf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodename: Option<String>,

    /// Deprecated, use `nodename` instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

impl NetConf {
    /// Network names end up in datastore keys and interface bookkeeping, so
    /// only `[A-Za-z0-9_.-]` is allowed.
    pub fn validate_name(&self) -> Result<()> {
        let valid = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(Error::InvalidNetworkConfig(format!(
                "invalid characters in network name {:?}; only letters a-z, numbers 0-9, \
                 and symbols _.- are supported",
                self.name
            )));
        }
        Ok(())
    }

    pub fn validate_version(&self) -> Result<()> {
        if crate::SUPPORTED_CNI_VERSIONS.contains(&self.cni_version) {
            Ok(())
        } else {
            Err(Error::IncompatibleVersion(self.cni_version.to_string()))
        }
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.unwrap_or(1500)
    }

    /// Datastore connection settings, taken from the config with the
    /// conventional environment variables as fallback.
    pub fn datastore_config(&self) -> calico_cni_datastore::DatastoreConfig {
        let kubernetes = self.kubernetes.clone().unwrap_or_default();
        let policy = self.policy.clone().unwrap_or_default();
        calico_cni_datastore::DatastoreConfig {
            datastore_type: self.datastore_type.clone(),
            etcd_endpoints: self.etcd_endpoints.clone(),
            etcd_authority: self.etcd_authority.clone(),
            etcd_scheme: self.etcd_scheme.clone(),
            etcd_key_file: self.etcd_key_file.clone(),
            etcd_cert_file: self.etcd_cert_file.clone(),
            etcd_ca_cert_file: self.etcd_ca_cert_file.clone(),
            kubeconfig: kubernetes.kubeconfig.clone(),
            k8s_api_root: kubernetes.k8s_api_root.or(policy.k8s_api_root),
            k8s_auth_token: policy.k8s_auth_token,
        }
        .with_env_fallback()
    }
}

fn default_cni_version() -> Version {
    CNI_VERSION
}

fn deserialize_cni_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s.as_deref() {
        None | Some("") => Ok(CNI_VERSION),
        Some(v) => v.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IpamConf {
    #[serde(default)]
    pub r#type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_ipv4: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_ipv6: Option<String>,

    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KubernetesConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_api_root: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyConf {
    #[serde(rename = "type", default)]
    pub policy_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_api_root: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_auth_token: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ip {
    /// "4" or "6"; part of the 0.3.x wire format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub address: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

impl Ip {
    pub fn new(address: IpNetwork) -> Self {
        let version = if address.is_ipv4() { "4" } else { "6" };
        Self {
            version: Some(version.into()),
            address,
            gateway: None,
            interface: None,
        }
    }

    /// The same address with a host mask, the only form stored on endpoints.
    pub fn host_network(&self) -> IpNetwork {
        host_network(self.address.ip())
    }
}

pub fn host_network(addr: IpAddr) -> IpNetwork {
    let prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    // A host prefix is always valid for the matching family.
    IpNetwork::new(addr, prefix).unwrap()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub dst: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    #[serde(
        serialize_with = "crate::serialize_to_string_slice",
        deserialize_with = "crate::deserialize_from_str_vec",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nameservers: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cni_version_defaults() {
        let input = Input::from_json(r#"{"name": "net1", "type": "calico"}"#).unwrap();
        assert_eq!(input.conf.cni_version, CNI_VERSION);
        assert_eq!(input.conf.name, "net1");
    }

    #[test]
    fn unknown_fields_survive_in_the_raw_value() {
        let input = Input::from_json(
            r#"{"name": "net1", "type": "calico", "ipam": {"type": "host-local", "subnet": "10.0.0.0/8", "routes": [{"dst": "0.0.0.0/0"}]}}"#,
        )
        .unwrap();
        assert_eq!(input.conf.ipam.r#type, "host-local");
        assert_eq!(input.conf.ipam.subnet.as_deref(), Some("10.0.0.0/8"));
        assert!(input.raw["ipam"]["routes"].is_array());
    }

    #[test]
    fn network_name_validation() {
        let mut input = Input::from_json(r#"{"name": "k8s_pod.network-1"}"#).unwrap();
        assert!(input.conf.validate_name().is_ok());

        input.conf.name = "bad name".into();
        assert!(input.conf.validate_name().is_err());
        input.conf.name = String::new();
        assert!(input.conf.validate_name().is_err());
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let input = Input::from_json(r#"{"cniVersion": "0.9.9", "name": "net1"}"#).unwrap();
        assert!(input.conf.validate_version().is_err());
        let input = Input::from_json(r#"{"cniVersion": "0.2.0", "name": "net1"}"#).unwrap();
        assert!(input.conf.validate_version().is_ok());
    }

    #[test]
    fn host_network_masks_by_family() {
        assert_eq!(
            host_network("10.0.0.1".parse().unwrap()).to_string(),
            "10.0.0.1/32"
        );
        assert_eq!(
            host_network("fd00::1".parse().unwrap()).to_string(),
            "fd00::1/128"
        );
    }
}
