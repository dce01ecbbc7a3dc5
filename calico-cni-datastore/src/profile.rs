use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named bundle of policy rules referenced by endpoints. The plugin only
/// ever creates the permissive default used for generic CNI networks; rule
/// evaluation belongs to the host agent.
#[derive(
    CustomResource, JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug,
)]
#[kube(
    group = "crd.projectcalico.org",
    version = "v1",
    kind = "Profile",
    plural = "profiles",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<Rule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<Rule>,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub action: String,
}

impl Profile {
    /// The allow-everything profile created for a generic CNI network name.
    pub fn default_allow(name: &str) -> Self {
        Profile::new(
            name,
            ProfileSpec {
                ingress: vec![Rule { action: "Allow".into() }],
                egress: vec![Rule { action: "Allow".into() }],
            },
        )
    }
}
