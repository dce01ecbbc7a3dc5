use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use ipnetwork::IpNetwork;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::response::Success;
use crate::types::NetConf;
use crate::{Error, Result};

/// Per-invocation parameters forwarded to the delegate's environment. Built
/// explicitly so a release for a superseded container can carry that
/// container's ID rather than whatever this process was invoked with.
#[derive(Clone, Debug)]
pub struct DelegateEnv<'a> {
    pub container_id: &'a str,
    pub netns: &'a str,
    pub ifname: &'a str,
    pub args: &'a str,
    pub path: &'a str,
}

/// The key the IPAM delegate groups a container's reservations under.
pub fn handle_id(network: &str, container_id: &str) -> String {
    format!("{network}.{container_id}")
}

/// Delegates choke on the Kubernetes args the runtime passes, so
/// `IgnoreUnknown=1` always goes first.
pub fn ignore_unknown_args(raw_args: &str) -> String {
    if raw_args.is_empty() {
        "IgnoreUnknown=1".to_owned()
    } else {
        format!("IgnoreUnknown=1;{raw_args}")
    }
}

/// host-local keys releases by container ID; its `usePodCidr` placeholder
/// subnet only has to parse, not match anything.
pub fn needs_dummy_pod_cidr(conf: &NetConf) -> bool {
    conf.ipam.r#type == "host-local"
        && conf
            .ipam
            .subnet
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("usePodCidr"))
}

pub fn with_dummy_pod_cidr(stdin: &Value) -> Result<Value> {
    let mut rewritten = stdin.clone();
    let ipam = rewritten
        .get_mut("ipam")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::InvalidNetworkConfig("config has no ipam section".into()))?;
    ipam.insert("subnet".into(), json!("0.0.0.0/0"));
    Ok(rewritten)
}

/// Rewrite the ipam section to request one specific address, the form the
/// Calico IPAM delegate understands.
pub fn with_assigned_ip(stdin: &Value, ip: IpAddr) -> Result<Value> {
    let mut rewritten = stdin.clone();
    let ipam = rewritten
        .get_mut("ipam")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::InvalidNetworkConfig("config has no ipam section".into()))?;
    ipam.insert("ip".into(), json!(ip.to_string()));
    Ok(rewritten)
}

/// Restrict the delegate to the pools a pod's annotations named.
pub fn with_pools(stdin: &Value, v4: &[IpNetwork], v6: &[IpNetwork]) -> Result<Value> {
    let mut rewritten = stdin.clone();
    let ipam = rewritten
        .get_mut("ipam")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::InvalidNetworkConfig("config has no ipam section".into()))?;
    if !v4.is_empty() {
        let pools: Vec<String> = v4.iter().map(|p| p.to_string()).collect();
        ipam.insert("ipv4_pools".into(), json!(pools));
    }
    if !v6.is_empty() {
        let pools: Vec<String> = v6.iter().map(|p| p.to_string()).collect();
        ipam.insert("ipv6_pools".into(), json!(pools));
    }
    Ok(rewritten)
}

pub enum IpamDriver {
    Exec(ExecDelegate),
    #[cfg(test)]
    Fake(crate::testutil::FakeIpam),
}

impl IpamDriver {
    pub async fn assign(
        &self,
        conf: &NetConf,
        stdin: &Value,
        env: &DelegateEnv<'_>,
    ) -> Result<Success> {
        match self {
            IpamDriver::Exec(exec) => exec.assign(conf, stdin, env).await,
            #[cfg(test)]
            IpamDriver::Fake(fake) => fake.assign(conf, stdin, env),
        }
    }

    /// Invoke the delegate in DEL mode with the (possibly rewritten) config.
    /// Used both for teardown and to compensate a failed ADD.
    pub async fn release(
        &self,
        conf: &NetConf,
        stdin: &Value,
        env: &DelegateEnv<'_>,
    ) -> Result<()> {
        let stdin = if needs_dummy_pod_cidr(conf) {
            info!("using a dummy podCidr to release the IP");
            with_dummy_pod_cidr(stdin)?
        } else {
            stdin.clone()
        };
        match self {
            IpamDriver::Exec(exec) => exec.release(conf, &stdin, env).await,
            #[cfg(test)]
            IpamDriver::Fake(fake) => fake.release(conf, &stdin, env),
        }
    }
}

/// Runs the external IPAM binary named by `ipam.type`, searched for under
/// `CNI_PATH`, with this invocation's environment and config on stdin.
pub struct ExecDelegate;

impl ExecDelegate {
    async fn assign(&self, conf: &NetConf, stdin: &Value, env: &DelegateEnv<'_>) -> Result<Success> {
        let output = self.invoke("ADD", conf, stdin, env).await?;
        if !output.status.success() {
            return Err(delegate_error(&output));
        }
        let result = Success::parse(&conf.cni_version, &output.stdout)?;
        if result.ips.is_empty() {
            return Err(Error::Ipam(
                "IPAM plugin did not return any IP addresses".into(),
            ));
        }
        Ok(result)
    }

    async fn release(&self, conf: &NetConf, stdin: &Value, env: &DelegateEnv<'_>) -> Result<()> {
        let output = self.invoke("DEL", conf, stdin, env).await?;
        if !output.status.success() {
            return Err(delegate_error(&output));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        command: &str,
        conf: &NetConf,
        stdin: &Value,
        env: &DelegateEnv<'_>,
    ) -> Result<std::process::Output> {
        let plugin = find_plugin(&conf.ipam.r#type, env.path)?;
        debug!(plugin = %plugin.display(), command, "invoking IPAM delegate");

        let mut child = Command::new(&plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", env.container_id)
            .env("CNI_NETNS", env.netns)
            .env("CNI_IFNAME", env.ifname)
            .env("CNI_ARGS", ignore_unknown_args(env.args))
            .env("CNI_PATH", env.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Ipam(format!("failed to spawn {}: {e}", plugin.display())))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(&serde_json::to_vec(stdin)?).await?;
        }
        Ok(child.wait_with_output().await?)
    }
}

fn find_plugin(ipam_type: &str, cni_path: &str) -> Result<PathBuf> {
    if ipam_type.is_empty() {
        return Err(Error::InvalidNetworkConfig("ipam.type is not set".into()));
    }
    for dir in cni_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = PathBuf::from(dir).join(ipam_type);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::Ipam(format!(
        "could not find IPAM plugin {ipam_type:?} in path {cni_path:?}"
    )))
}

fn delegate_error(output: &std::process::Output) -> Error {
    #[derive(serde::Deserialize)]
    struct DelegateFailure {
        code: u32,
        msg: String,
        #[serde(default)]
        details: String,
    }
    match serde_json::from_slice::<DelegateFailure>(&output.stdout) {
        Ok(failure) => Error::Delegate {
            code: failure.code,
            msg: failure.msg,
            details: failure.details,
        },
        Err(_) => Error::Ipam(format!(
            "IPAM plugin exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Input;

    fn input(json: &str) -> Input {
        Input::from_json(json).unwrap()
    }

    #[test]
    fn handle_joins_network_and_container() {
        assert_eq!(handle_id("net1", "abc123"), "net1.abc123");
    }

    #[test]
    fn ignore_unknown_goes_first() {
        assert_eq!(ignore_unknown_args(""), "IgnoreUnknown=1");
        assert_eq!(
            ignore_unknown_args("K8S_POD_NAME=nginx"),
            "IgnoreUnknown=1;K8S_POD_NAME=nginx"
        );
    }

    #[test]
    fn dummy_pod_cidr_only_applies_to_host_local_use_pod_cidr() {
        let input = input(
            r#"{"name": "net1", "ipam": {"type": "host-local", "subnet": "usePodCidr"}}"#,
        );
        assert!(needs_dummy_pod_cidr(&input.conf));

        let rewritten = with_dummy_pod_cidr(&input.raw).unwrap();
        assert_eq!(rewritten["ipam"]["subnet"], "0.0.0.0/0");
        // The original is untouched.
        assert_eq!(input.raw["ipam"]["subnet"], "usePodCidr");

        let other = Input::from_json(
            r#"{"name": "net1", "ipam": {"type": "calico-ipam", "subnet": "usePodCidr"}}"#,
        )
        .unwrap();
        assert!(!needs_dummy_pod_cidr(&other.conf));
    }

    #[test]
    fn assigned_ip_lands_in_the_ipam_section() {
        let input = input(r#"{"name": "net1", "ipam": {"type": "calico-ipam"}}"#);
        let rewritten = with_assigned_ip(&input.raw, "20.0.0.111".parse().unwrap()).unwrap();
        assert_eq!(rewritten["ipam"]["ip"], "20.0.0.111");
        assert_eq!(rewritten["ipam"]["type"], "calico-ipam");
    }

    #[test]
    fn pools_land_in_the_ipam_section() {
        let input = input(r#"{"name": "net1", "ipam": {"type": "calico-ipam"}}"#);
        let rewritten = with_pools(
            &input.raw,
            &["172.16.0.0/16".parse().unwrap()],
            &[],
        )
        .unwrap();
        assert_eq!(rewritten["ipam"]["ipv4_pools"][0], "172.16.0.0/16");
        assert!(rewritten["ipam"].get("ipv6_pools").is_none());
    }

    #[test]
    fn missing_ipam_section_is_rejected() {
        let raw: Value = serde_json::from_str(r#"{"name": "net1"}"#).unwrap();
        assert!(with_dummy_pod_cidr(&raw).is_err());
    }

    #[test]
    fn find_plugin_searches_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("host-local");
        std::fs::write(&plugin, b"#!/bin/sh\n").unwrap();

        let path = format!("/nonexistent:{}", dir.path().display());
        assert_eq!(find_plugin("host-local", &path).unwrap(), plugin);
        assert!(find_plugin("calico-ipam", &path).is_err());
        assert!(find_plugin("", &path).is_err());
    }
}
