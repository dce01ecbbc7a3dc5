use std::collections::BTreeMap;

use clap::Parser;

use crate::{Error, Result};

/// The CNI contract passes every invocation parameter through the
/// environment; stdin carries only the network config.
#[derive(Parser, Clone, Debug)]
#[command(about, long_about = None)]
pub struct Args {
    /// Possible values are ADD, DEL, CHECK, VERSION
    #[arg(long, env = "CNI_COMMAND", value_parser = parse_command)]
    pub command: Command,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path to the container network namespace
    #[arg(long, env = "CNI_NETNS", default_value = "")]
    pub netns: String,

    /// Interface name to create inside the container
    #[arg(long, env = "CNI_IFNAME", default_value = "eth0")]
    pub ifname: String,

    /// Key-value pairs separated by semi-colons
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// Colon-separated list of directories to search for plugins
    #[arg(long, env = "CNI_PATH", default_value = "")]
    pub path: String,
}

impl Args {
    /// ADD and CHECK need the full environment; DEL tolerates a missing
    /// namespace.
    pub fn validate_for_add(&self) -> Result<()> {
        if self.container_id.is_empty() {
            return Err(Error::InvalidEnv("CNI_CONTAINERID is not set".into()));
        }
        if self.netns.is_empty() {
            return Err(Error::InvalidEnv("CNI_NETNS is not set".into()));
        }
        if self.ifname.is_empty() {
            return Err(Error::InvalidEnv("CNI_IFNAME is not set".into()));
        }
        Ok(())
    }

    pub fn validate_for_delete(&self) -> Result<()> {
        if self.container_id.is_empty() {
            return Err(Error::InvalidEnv("CNI_CONTAINERID is not set".into()));
        }
        if self.ifname.is_empty() {
            return Err(Error::InvalidEnv("CNI_IFNAME is not set".into()));
        }
        Ok(())
    }

    pub fn cni_args(&self) -> BTreeMap<String, String> {
        parse_cni_args(&self.args)
    }
}

/// Parse the semicolon-delimited `CNI_ARGS` string. Entries without an `=`
/// are skipped rather than rejected; runtimes routinely pass args only the
/// IPAM plugin understands.
pub fn parse_cni_args(s: &str) -> BTreeMap<String, String> {
    let mut kv = BTreeMap::new();
    for split in s.split(';') {
        if let Some((k, v)) = split.split_once('=') {
            kv.insert(k.to_owned(), v.to_owned());
        }
    }
    kv
}

fn parse_command(s: &str) -> Result<Command> {
    let cmd = match s {
        "ADD" => Command::Add,
        "DEL" => Command::Delete,
        "CHECK" => Command::Check,
        "VERSION" => Command::Version,
        other => {
            return Err(Error::InvalidEnv(format!(
                "CNI_COMMAND {other:?} is not supported"
            )))
        }
    };
    Ok(cmd)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Add,
    Delete,
    Check,
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cni_args_parse_into_pairs() {
        let kv = parse_cni_args("IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx");
        assert_eq!(kv["K8S_POD_NAMESPACE"], "default");
        assert_eq!(kv["K8S_POD_NAME"], "nginx");
        assert_eq!(kv.len(), 3);
    }

    #[test]
    fn empty_and_malformed_entries_are_skipped() {
        assert!(parse_cni_args("").is_empty());
        let kv = parse_cni_args("novalue;K=V");
        assert_eq!(kv.len(), 1);
        assert_eq!(kv["K"], "V");
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(parse_command("GC").is_err());
        assert_eq!(parse_command("DEL").unwrap(), Command::Delete);
    }
}
