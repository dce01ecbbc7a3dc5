use tracing::info;

use crate::config::Args;
use crate::response::Response;
use crate::types::Input;

/// CHECK validates what it can without touching the host: the config and
/// the environment. Interface state belongs to the host agent.
pub fn check(args: &Args, input: Input) -> Response {
    let cni_version = input.conf.cni_version.clone();
    if let Err(e) = input
        .conf
        .validate_name()
        .and_then(|_| input.conf.validate_version())
        .and_then(|_| args.validate_for_add())
    {
        return e.into_response(cni_version);
    }
    info!(network = %input.conf.name, container = %args.container_id, "check passed");
    Response::Check
}
