use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use calico_cni_datastore::endpoint::{ORCHESTRATOR_CNI, ORCHESTRATOR_K8S};

pub const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
pub const K8S_POD_NAME: &str = "K8S_POD_NAME";
pub const K8S_POD_INFRA_CONTAINER_ID: &str = "K8S_POD_INFRA_CONTAINER_ID";
/// Test-only override for the namespace used by non-k8s workloads; subject
/// to change without notice.
pub const CNI_TEST_NAMESPACE: &str = "CNI_TEST_NAMESPACE";

/// Interface names cap at IFNAMSIZ - 1 on Linux.
const MAX_IFNAME_LEN: usize = 15;
const HOST_VETH_PREFIX: &str = "cali";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orchestrator {
    K8s,
    Cni,
}

impl Orchestrator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orchestrator::K8s => ORCHESTRATOR_K8S,
            Orchestrator::Cni => ORCHESTRATOR_CNI,
        }
    }
}

/// The identity tuple an endpoint is keyed by. The derived names are pure
/// functions of this tuple: a DEL can always recompute the names a prior
/// ADD stored under.
#[derive(Clone, Debug)]
pub struct Identifiers {
    pub node: String,
    pub orchestrator: Orchestrator,
    pub pod: String,
    pub namespace: String,
    pub container_id: String,
    pub endpoint: String,
}

impl Identifiers {
    /// Workloads run under Kubernetes exactly when the runtime passed both
    /// the pod name and namespace; anything else is generic CNI in the
    /// "default" namespace.
    pub fn resolve(
        cni_args: &BTreeMap<String, String>,
        container_id: &str,
        ifname: &str,
        nodename: &str,
    ) -> Self {
        let pod_name = cni_args.get(K8S_POD_NAME).filter(|v| !v.is_empty());
        let pod_namespace = cni_args.get(K8S_POD_NAMESPACE).filter(|v| !v.is_empty());

        match (pod_namespace, pod_name) {
            (Some(namespace), Some(pod)) => Identifiers {
                node: nodename.to_owned(),
                orchestrator: Orchestrator::K8s,
                pod: pod.clone(),
                namespace: namespace.clone(),
                container_id: container_id.to_owned(),
                endpoint: ifname.to_owned(),
            },
            _ => Identifiers {
                node: nodename.to_owned(),
                orchestrator: Orchestrator::Cni,
                pod: String::new(),
                namespace: cni_args
                    .get(CNI_TEST_NAMESPACE)
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .unwrap_or_else(|| "default".to_owned()),
                container_id: container_id.to_owned(),
                endpoint: ifname.to_owned(),
            },
        }
    }

    /// Stable datastore name for the endpoint. Changing this scheme is a
    /// migration event: DELs locate endpoints from prior ADDs through it.
    pub fn endpoint_name(&self) -> String {
        match self.orchestrator {
            Orchestrator::K8s => format!(
                "{}-k8s-{}-{}",
                self.node, self.pod, self.endpoint
            ),
            Orchestrator::Cni => format!(
                "{}-cni-{}-{}",
                self.node, self.container_id, self.endpoint
            ),
        }
    }

    /// Host-side veth name. Kubernetes workloads hash (namespace, pod) so
    /// the name survives container restarts; generic CNI uses the container
    /// ID directly.
    pub fn host_veth_name(&self) -> String {
        let max_suffix = MAX_IFNAME_LEN - HOST_VETH_PREFIX.len();
        let suffix: String = match self.orchestrator {
            Orchestrator::K8s => {
                let mut hasher = Sha256::new();
                hasher.update(self.namespace.as_bytes());
                hasher.update(b".");
                hasher.update(self.pod.as_bytes());
                format!("{:x}", hasher.finalize())
                    .chars()
                    .take(max_suffix)
                    .collect()
            }
            Orchestrator::Cni => self.container_id.chars().take(max_suffix).collect(),
        };
        format!("{HOST_VETH_PREFIX}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn k8s_requires_both_pod_and_namespace() {
        let ids = Identifiers::resolve(
            &args(&[(K8S_POD_NAMESPACE, "test"), (K8S_POD_NAME, "nginx")]),
            "abc123",
            "eth0",
            "node1",
        );
        assert_eq!(ids.orchestrator, Orchestrator::K8s);
        assert_eq!(ids.namespace, "test");
        assert_eq!(ids.pod, "nginx");

        let ids = Identifiers::resolve(
            &args(&[(K8S_POD_NAME, "nginx")]),
            "abc123",
            "eth0",
            "node1",
        );
        assert_eq!(ids.orchestrator, Orchestrator::Cni);
        assert_eq!(ids.namespace, "default");
        assert_eq!(ids.pod, "");
    }

    #[test]
    fn test_namespace_override_applies_to_generic_cni() {
        let ids = Identifiers::resolve(
            &args(&[(CNI_TEST_NAMESPACE, "testing")]),
            "abc123",
            "eth0",
            "node1",
        );
        assert_eq!(ids.namespace, "testing");
    }

    #[test]
    fn endpoint_names_are_deterministic() {
        let ids = Identifiers::resolve(
            &args(&[(K8S_POD_NAMESPACE, "test"), (K8S_POD_NAME, "nginx")]),
            "abc123",
            "eth0",
            "node1",
        );
        assert_eq!(ids.endpoint_name(), "node1-k8s-nginx-eth0");

        let ids = Identifiers::resolve(&args(&[]), "abc123", "eth0", "node1");
        assert_eq!(ids.endpoint_name(), "node1-cni-abc123-eth0");
    }

    #[test]
    fn generic_cni_veth_name_truncates_the_container_id() {
        let ids = Identifiers::resolve(&args(&[]), "abc123", "eth0", "node1");
        assert_eq!(ids.host_veth_name(), "caliabc123");

        let ids = Identifiers::resolve(
            &args(&[]),
            "0123456789abcdef0123456789abcdef",
            "eth0",
            "node1",
        );
        assert_eq!(ids.host_veth_name(), "cali0123456789a");
        assert!(ids.host_veth_name().len() <= MAX_IFNAME_LEN);
    }

    #[test]
    fn k8s_veth_name_depends_only_on_namespace_and_pod() {
        let a = Identifiers::resolve(
            &args(&[(K8S_POD_NAMESPACE, "test"), (K8S_POD_NAME, "nginx")]),
            "container-x",
            "eth0",
            "node1",
        );
        let b = Identifiers::resolve(
            &args(&[(K8S_POD_NAMESPACE, "test"), (K8S_POD_NAME, "nginx")]),
            "container-y",
            "eth0",
            "node2",
        );
        assert_eq!(a.host_veth_name(), b.host_veth_name());
        assert!(a.host_veth_name().starts_with("cali"));
        assert_eq!(a.host_veth_name().len(), MAX_IFNAME_LEN);

        let c = Identifiers::resolve(
            &args(&[(K8S_POD_NAMESPACE, "test"), (K8S_POD_NAME, "other")]),
            "container-x",
            "eth0",
            "node1",
        );
        assert_ne!(a.host_veth_name(), c.host_veth_name());
    }
}
