use semver::Version;
use thiserror::Error;

use crate::response::{CniErrorResponse, Response};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("incompatible CNI version {0}")]
    IncompatibleVersion(String),

    #[error("invalid environment variables: {0}")]
    InvalidEnv(String),

    #[error("invalid network config: {0}")]
    InvalidNetworkConfig(String),

    #[error("invalid pod annotation: {0}")]
    InvalidAnnotation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("IPAM error: {0}")]
    Ipam(String),

    /// A CNI-formatted error returned by the IPAM delegate, passed through
    /// with its original code.
    #[error("IPAM delegate failed (code {code}): {msg}")]
    Delegate { code: u32, msg: String, details: String },

    #[error("failed to configure networking: {0}")]
    Wiring(String),

    #[error("network namespace error: {0}")]
    Netns(String),

    #[error(transparent)]
    Datastore(#[from] calico_cni_datastore::Error),

    #[error("transient error: {0}")]
    Transient(String),
}

impl Error {
    pub fn into_response(self, cni_version: Version) -> Response {
        let (code, msg) = match &self {
            Error::IncompatibleVersion(_) => (1, "Incompatible CNI Version"),
            Error::InvalidEnv(_) => (4, "Invalid Required Environment Variables"),
            Error::Io(_) => (5, "I/O Error"),
            Error::Json(_) | Error::Parse(_) => (6, "Decoding Failure"),
            Error::InvalidNetworkConfig(_) => (7, "Invalid Network Config"),
            Error::InvalidAnnotation(_) => (7, "Invalid Pod Annotation"),
            Error::Transient(_) => (11, "Transient Error"),
            Error::Ipam(_) => (100, "IPAM Error"),
            Error::Delegate { code, .. } => (*code, "IPAM Error"),
            Error::Wiring(_) => (101, "Networking Error"),
            Error::Datastore(e) if e.is_conflict() => (11, "Datastore Conflict"),
            Error::Datastore(_) => (102, "Datastore Error"),
            Error::Netns(_) => (103, "Network Namespace Error"),
        };
        Response::Error(CniErrorResponse {
            cni_version,
            code,
            msg: msg.into(),
            details: self.to_string(),
        })
    }
}
