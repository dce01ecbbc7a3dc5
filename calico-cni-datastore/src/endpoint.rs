use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the namespace a workload belongs to.
pub const LABEL_NAMESPACE: &str = "projectcalico.org/namespace";
/// Label carrying the orchestrator that created the workload.
pub const LABEL_ORCHESTRATOR: &str = "projectcalico.org/orchestrator";

pub const ORCHESTRATOR_K8S: &str = "k8s";
pub const ORCHESTRATOR_CNI: &str = "cni";

/// One container's network attachment: the host interface it hangs off, the
/// addresses routed to it, and the identity it was created under.
#[derive(
    CustomResource, JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug,
)]
#[kube(
    group = "crd.projectcalico.org",
    version = "v1",
    kind = "WorkloadEndpoint",
    plural = "workloadendpoints",
    namespaced,
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod: String,

    /// Name of the host side of the veth pair.
    pub interface_name: String,

    /// Addresses routed to the workload, always /32 or /128.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_networks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,

    pub node: String,

    /// Interface name inside the workload namespace.
    pub endpoint: String,

    /// Legacy identifier, left empty by this plugin.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload: String,

    #[serde(rename = "containerID")]
    pub container_id: String,

    pub orchestrator: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<EndpointPort>,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPort {
    pub name: String,
    pub protocol: String,
    pub port: u16,
}

impl WorkloadEndpoint {
    /// Build an endpoint record with the standard identity labels applied.
    pub fn create(namespace: &str, name: &str, spec: WorkloadEndpointSpec) -> Self {
        let mut wep = WorkloadEndpoint::new(name, spec);
        wep.metadata.namespace = Some(namespace.to_owned());
        let labels = wep.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(LABEL_NAMESPACE.to_owned(), namespace.to_owned());
        labels.insert(
            LABEL_ORCHESTRATOR.to_owned(),
            wep.spec.orchestrator.clone(),
        );
        wep
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkloadEndpointSpec {
        WorkloadEndpointSpec {
            pod: "nginx".into(),
            interface_name: "cali0123456789a".into(),
            ip_networks: vec!["10.0.0.1/32".into()],
            mac: Some("ee:ee:ee:ee:ee:ee".into()),
            profiles: vec!["kns.default".into()],
            node: "node1".into(),
            endpoint: "eth0".into(),
            workload: String::new(),
            container_id: "abc123".into(),
            orchestrator: ORCHESTRATOR_K8S.into(),
            ports: Vec::new(),
        }
    }

    #[test]
    fn create_applies_identity_labels() {
        let wep = WorkloadEndpoint::create("default", "node1-k8s-nginx-eth0", spec());
        let labels = wep.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_NAMESPACE], "default");
        assert_eq!(labels[LABEL_ORCHESTRATOR], "k8s");
        assert_eq!(wep.namespace(), "default");
        assert_eq!(wep.name(), "node1-k8s-nginx-eth0");
    }

    #[test]
    fn spec_serializes_with_calico_field_names() {
        let value = serde_json::to_value(spec()).unwrap();
        assert_eq!(value["interfaceName"], "cali0123456789a");
        assert_eq!(value["ipNetworks"][0], "10.0.0.1/32");
        assert_eq!(value["containerID"], "abc123");
        // The legacy workload field is omitted when empty.
        assert!(value.get("workload").is_none());
    }
}
