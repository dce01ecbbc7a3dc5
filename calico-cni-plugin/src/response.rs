use std::io::Write;
use std::process::ExitCode;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{Dns, Interface, Ip, Route};
use crate::{Error, Result};

#[derive(Serialize, Deserialize)]
pub enum Response {
    Success(Success),
    Error(CniErrorResponse),
    Version(VersionResponse),
    Check,
    /// DEL emits nothing on success.
    Empty,
}

impl Response {
    pub fn write_out(self) -> ExitCode {
        let (out, code) = match &self {
            Response::Success(success) => match success.render() {
                Ok(out) => (out, ExitCode::SUCCESS),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Error(error) => match serde_json::to_vec(error) {
                Ok(out) => (out, ExitCode::FAILURE),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Version(version) => match serde_json::to_vec(version) {
                Ok(out) => (out, ExitCode::SUCCESS),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Check => (Vec::new(), ExitCode::SUCCESS),
            Response::Empty => (Vec::new(), ExitCode::SUCCESS),
        };
        std::io::stdout()
            .write_all(&out)
            .expect("failed to write response to stdout");
        code
    }
}

/// A CNI result. Serialized in the 0.3.x shape; [`Success::render`]
/// down-converts for 0.2.0 configs.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Success {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    #[serde(default)]
    pub ips: Vec<Ip>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

impl Success {
    pub fn render(&self) -> Result<Vec<u8>> {
        if self.cni_version.major == 0 && self.cni_version.minor == 2 {
            Ok(serde_json::to_vec(&self.to_legacy())?)
        } else {
            Ok(serde_json::to_vec(self)?)
        }
    }

    /// The 0.2.0 wire form keyed by address family.
    fn to_legacy(&self) -> Value {
        let mut out = json!({ "cniVersion": self.cni_version.to_string() });
        for ip in &self.ips {
            let key = if ip.address.is_ipv4() { "ip4" } else { "ip6" };
            if out.get(key).is_some() {
                continue;
            }
            let mut entry = json!({ "ip": ip.address.to_string() });
            if let Some(gw) = ip.gateway {
                entry["gateway"] = json!(gw.to_string());
            }
            if !self.routes.is_empty() {
                entry["routes"] = serde_json::to_value(&self.routes).unwrap_or(Value::Null);
            }
            out[key] = entry;
        }
        if let Some(dns) = &self.dns {
            out["dns"] = serde_json::to_value(dns).unwrap_or(Value::Null);
        }
        out
    }

    /// Parse a delegate's stdout, accepting both the 0.3.x and the legacy
    /// 0.2.0 shapes regardless of what the config asked for; host-local
    /// answers in whichever format it was built against.
    pub fn parse(cni_version: &Version, bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        if value.get("ip4").is_some() || value.get("ip6").is_some() {
            return Self::from_legacy(cni_version, &value);
        }
        let mut success: Success = serde_json::from_value(value)?;
        success.cni_version = cni_version.clone();
        Ok(success)
    }

    fn from_legacy(cni_version: &Version, value: &Value) -> Result<Self> {
        let mut ips = Vec::new();
        for key in ["ip4", "ip6"] {
            let Some(entry) = value.get(key) else { continue };
            let address = entry
                .get("ip")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Parse(format!("legacy result {key} missing ip")))?
                .parse()
                .map_err(|e| Error::Parse(format!("legacy result {key}: {e}")))?;
            let gateway = entry
                .get("gateway")
                .and_then(Value::as_str)
                .and_then(|gw| gw.parse().ok());
            let mut ip = Ip::new(address);
            ip.gateway = gateway;
            ips.push(ip);
        }
        Ok(Success {
            cni_version: cni_version.clone(),
            interfaces: Vec::new(),
            ips,
            routes: Vec::new(),
            dns: None,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(
        serialize_with = "crate::serialize_to_string_slice",
        deserialize_with = "crate::deserialize_from_str_vec"
    )]
    pub supported_versions: Vec<Version>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,
    pub code: u32,
    pub msg: String,
    pub details: String,
}
