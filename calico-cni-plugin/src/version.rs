use crate::response::{Response, VersionResponse};
use crate::{CNI_VERSION, SUPPORTED_CNI_VERSIONS};

pub fn version() -> Response {
    Response::Version(VersionResponse {
        cni_version: CNI_VERSION,
        supported_versions: SUPPORTED_CNI_VERSIONS.to_vec(),
    })
}
