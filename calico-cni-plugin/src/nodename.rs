use std::fs;

use tracing::{debug, warn};

use crate::types::NetConf;

/// Node identity written by the node agent on startup.
pub const NODENAME_FILE: &str = "/var/lib/calico/nodename";

/// The node name endpoints are registered under, in ascending precedence:
/// OS hostname, the deprecated `hostname` config field, the nodename file,
/// the `nodename` config field.
pub fn resolve(conf: &NetConf) -> String {
    resolve_from(conf, nodename_from_file(), os_hostname())
}

pub(crate) fn resolve_from(
    conf: &NetConf,
    file_nodename: Option<String>,
    os_hostname: String,
) -> String {
    let mut nodename = os_hostname;
    if let Some(hostname) = conf.hostname.as_deref().filter(|h| !h.is_empty()) {
        nodename = hostname.to_owned();
        warn!("Configuration option 'hostname' is deprecated, use 'nodename' instead.");
    }
    if let Some(from_file) = file_nodename.filter(|n| !n.is_empty()) {
        debug!(nodename = %from_file, "read node name from file");
        nodename = from_file;
    }
    if let Some(configured) = conf.nodename.as_deref().filter(|n| !n.is_empty()) {
        debug!(nodename = %configured, "read node name from CNI config");
        nodename = configured.to_owned();
    }
    debug!(%nodename, "using node name");
    nodename
}

fn nodename_from_file() -> Option<String> {
    match fs::read_to_string(NODENAME_FILE) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(%e, "failed to read {NODENAME_FILE}");
            None
        }
    }
}

fn os_hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}
