use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tracing::debug;

use calico_cni_datastore::endpoint::EndpointPort;

use crate::{Error, Result};

pub const ANNOTATION_IPV4_POOLS: &str = "cni.projectcalico.org/ipv4pools";
pub const ANNOTATION_IPV6_POOLS: &str = "cni.projectcalico.org/ipv6pools";
pub const ANNOTATION_IP_ADDRS: &str = "cni.projectcalico.org/ipAddrs";
pub const ANNOTATION_IP_ADDRS_NO_IPAM: &str = "cni.projectcalico.org/ipAddrsNoIpam";

/// What the plugin needs from the pod object: its annotations and any named
/// container ports.
#[derive(Clone, Debug, Default)]
pub struct PodInfo {
    pub annotations: BTreeMap<String, String>,
    pub ports: Vec<EndpointPort>,
}

/// Where pod metadata comes from. Kubernetes workloads read the API server;
/// generic CNI workloads have no pod to read.
pub enum PodSource {
    Kube(kube::Client),
    #[cfg(test)]
    Static(PodInfo),
}

impl PodSource {
    pub async fn pod_info(&self, namespace: &str, pod: &str) -> Result<PodInfo> {
        match self {
            PodSource::Kube(client) => {
                let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
                let pod = api.get(pod).await.map_err(calico_cni_datastore::Error::from)?;
                Ok(pod_info_from(&pod))
            }
            #[cfg(test)]
            PodSource::Static(info) => Ok(info.clone()),
        }
    }
}

fn pod_info_from(pod: &Pod) -> PodInfo {
    let annotations = pod
        .metadata
        .annotations
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();

    let mut ports = Vec::new();
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            for port in container.ports.iter().flatten() {
                // Only named ports are useful to policy; unnamed ones can't
                // be referenced.
                if let Some(name) = port.name.clone().filter(|n| !n.is_empty()) {
                    ports.push(EndpointPort {
                        name,
                        protocol: port.protocol.clone().unwrap_or_else(|| "TCP".into()),
                        port: port.container_port as u16,
                    });
                }
            }
        }
    }

    PodInfo { annotations, ports }
}

/// Addressing requests read from pod annotations.
#[derive(Clone, Debug, Default)]
pub struct IpOverrides {
    /// Restrict IPAM to these IPv4 pools.
    pub v4_pools: Vec<IpNetwork>,
    /// Restrict IPAM to these IPv6 pools.
    pub v6_pools: Vec<IpNetwork>,
    /// Assign exactly these addresses through IPAM.
    pub specific: Vec<IpAddr>,
    /// Use exactly these addresses without consulting IPAM at all.
    pub bypass: Vec<IpAddr>,
}

impl IpOverrides {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self> {
        let mut overrides = IpOverrides::default();

        if let Some(raw) = annotations.get(ANNOTATION_IPV4_POOLS) {
            overrides.v4_pools = parse_pools(raw, true)?;
        }
        if let Some(raw) = annotations.get(ANNOTATION_IPV6_POOLS) {
            overrides.v6_pools = parse_pools(raw, false)?;
        }
        if let Some(raw) = annotations.get(ANNOTATION_IP_ADDRS) {
            overrides.specific = parse_addrs(ANNOTATION_IP_ADDRS, raw)?;
        }
        if let Some(raw) = annotations.get(ANNOTATION_IP_ADDRS_NO_IPAM) {
            overrides.bypass = parse_addrs(ANNOTATION_IP_ADDRS_NO_IPAM, raw)?;
        }

        if !overrides.specific.is_empty() && !overrides.bypass.is_empty() {
            return Err(Error::InvalidAnnotation(format!(
                "{ANNOTATION_IP_ADDRS} and {ANNOTATION_IP_ADDRS_NO_IPAM} cannot be used together"
            )));
        }

        let v4 = overrides.bypass.iter().filter(|a| a.is_ipv4()).count();
        let v6 = overrides.bypass.iter().filter(|a| a.is_ipv6()).count();
        if v4 > 1 || v6 > 1 {
            return Err(Error::InvalidAnnotation(format!(
                "{ANNOTATION_IP_ADDRS_NO_IPAM} supports at most one IPv4 and one IPv6 address"
            )));
        }

        if !overrides.specific.is_empty() || !overrides.bypass.is_empty() {
            debug!(?overrides, "pod requested explicit addressing");
        }
        Ok(overrides)
    }
}

fn parse_addrs(key: &str, raw: &str) -> Result<Vec<IpAddr>> {
    let entries: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| Error::InvalidAnnotation(format!("{key} is not a JSON string array: {e}")))?;
    entries
        .iter()
        .map(|s| {
            s.parse()
                .map_err(|e| Error::InvalidAnnotation(format!("{key} entry {s:?}: {e}")))
        })
        .collect()
}

fn parse_pools(raw: &str, want_v4: bool) -> Result<Vec<IpNetwork>> {
    let key = if want_v4 {
        ANNOTATION_IPV4_POOLS
    } else {
        ANNOTATION_IPV6_POOLS
    };
    let entries: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| Error::InvalidAnnotation(format!("{key} is not a JSON string array: {e}")))?;
    let mut pools = Vec::with_capacity(entries.len());
    for entry in &entries {
        let pool: IpNetwork = entry
            .parse()
            .map_err(|e| Error::InvalidAnnotation(format!("{key} entry {entry:?}: {e}")))?;
        if pool.is_ipv4() != want_v4 {
            return Err(Error::InvalidAnnotation(format!(
                "{key} entry {entry:?} is the wrong address family"
            )));
        }
        pools.push(pool);
    }
    Ok(pools)
}
