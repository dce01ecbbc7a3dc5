//! Shared fakes for the command-core tests: an in-process IPAM delegate and
//! a wiring seam that records instead of touching the host.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use ipnetwork::IpNetwork;
use serde_json::Value;

use crate::config::{parse_cni_args, Args, Command};
use crate::ipam::{handle_id, DelegateEnv};
use crate::netlink::{WireOutcome, WireRequest};
use crate::response::Success;
use crate::types::{host_network, Input, Ip, NetConf};
use crate::{Error, Result};

pub(crate) const FAKE_MAC: &str = "ee:ee:ee:ee:ee:ee";

pub(crate) fn netconf(json: &str) -> Input {
    Input::from_json(json).expect("test netconf must parse")
}

pub(crate) fn args(container_id: &str, netns: &str, cni_args: &str) -> Args {
    Args {
        command: Command::Add,
        container_id: container_id.into(),
        netns: netns.into(),
        ifname: "eth0".into(),
        args: cni_args.into(),
        path: "/opt/cni/bin".into(),
    }
}

pub(crate) fn k8s_args(container_id: &str, netns: &str, namespace: &str, pod: &str) -> Args {
    args(
        container_id,
        netns,
        &format!("K8S_POD_NAMESPACE={namespace};K8S_POD_NAME={pod}"),
    )
}

/// Models enough of host-local and calico-ipam to exercise the driver
/// contract: reservations are grouped under `<network>.<containerID>`
/// handles, specific addresses and pool restrictions are honoured, and the
/// stdin it receives must always be valid (which is how the usePodCidr
/// rewrite is verified).
#[derive(Clone, Default)]
pub(crate) struct FakeIpam {
    state: Arc<Mutex<FakeIpamState>>,
}

#[derive(Default)]
struct FakeIpamState {
    handles: BTreeMap<String, Vec<IpNetwork>>,
    released: Vec<String>,
    fail_assign: bool,
}

impl FakeIpam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_assign(&self) {
        self.state.lock().unwrap().fail_assign = true;
    }

    pub fn handles(&self) -> Vec<String> {
        self.state.lock().unwrap().handles.keys().cloned().collect()
    }

    pub fn has_handle(&self, network: &str, container_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .handles
            .contains_key(&handle_id(network, container_id))
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn assign(
        &self,
        conf: &NetConf,
        stdin: &Value,
        env: &DelegateEnv<'_>,
    ) -> Result<Success> {
        let mut state = self.state.lock().unwrap();
        if state.fail_assign {
            state.fail_assign = false;
            return Err(Error::Ipam("injected IPAM failure".into()));
        }

        let ipam = stdin
            .get("ipam")
            .ok_or_else(|| Error::Ipam("stdin has no ipam section".into()))?;

        let address = if let Some(ip) = ipam.get("ip").and_then(Value::as_str) {
            let addr: IpAddr = ip
                .parse()
                .map_err(|e| Error::Ipam(format!("bad ip {ip:?}: {e}")))?;
            host_network(addr)
        } else if let Some(requested) = parse_cni_args(env.args).get("IP") {
            let addr: IpAddr = requested
                .parse()
                .map_err(|e| Error::Ipam(format!("bad requested IP {requested:?}: {e}")))?;
            host_network(addr)
        } else {
            let pool = if let Some(pools) = ipam.get("ipv4_pools").and_then(Value::as_array) {
                pools
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Ipam("empty ipv4_pools".into()))?
                    .to_owned()
            } else {
                ipam.get("subnet")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Ipam("no subnet configured".into()))?
                    .to_owned()
            };
            let pool: IpNetwork = pool
                .parse()
                .map_err(|e| Error::Ipam(format!("bad subnet {pool:?}: {e}")))?;
            Self::next_free(&state, &pool)?
        };

        let handle = handle_id(&conf.name, env.container_id);
        state.handles.entry(handle).or_default().push(address);

        Ok(Success {
            cni_version: conf.cni_version.clone(),
            interfaces: Vec::new(),
            ips: vec![Ip::new(address)],
            routes: Vec::new(),
            dns: None,
        })
    }

    fn next_free(state: &FakeIpamState, pool: &IpNetwork) -> Result<IpNetwork> {
        let IpNetwork::V4(pool) = pool else {
            return Err(Error::Ipam("fake delegate only allocates IPv4".into()));
        };
        let used: Vec<IpAddr> = state
            .handles
            .values()
            .flatten()
            .map(|net| net.ip())
            .collect();
        // Network and gateway addresses stay reserved.
        pool.iter()
            .skip(2)
            .map(IpAddr::V4)
            .find(|addr| !used.contains(addr))
            .map(|addr| {
                IpNetwork::new(addr, pool.prefix()).expect("pool prefix fits its own family")
            })
            .ok_or_else(|| Error::Ipam("no addresses left in pool".into()))
    }

    pub fn release(&self, conf: &NetConf, stdin: &Value, env: &DelegateEnv<'_>) -> Result<()> {
        // Whatever rewrites the driver applied, the config it hands over
        // must still be something a real delegate would accept.
        if let Some(subnet) = stdin
            .get("ipam")
            .and_then(|ipam| ipam.get("subnet"))
            .and_then(Value::as_str)
        {
            subnet
                .parse::<IpNetwork>()
                .map_err(|e| Error::Ipam(format!("unparseable subnet {subnet:?}: {e}")))?;
        }

        let mut state = self.state.lock().unwrap();
        let handle = handle_id(&conf.name, env.container_id);
        state.handles.remove(&handle);
        state.released.push(handle);
        Ok(())
    }
}

/// Records veth operations instead of performing them, and can be rigged to
/// fail the way a hostile host would.
#[derive(Clone, Default)]
pub(crate) struct FakeWiring {
    state: Arc<Mutex<FakeWiringState>>,
}

#[derive(Default)]
struct FakeWiringState {
    wired: BTreeMap<String, WiredIface>,
    unwired: Vec<(String, String)>,
    fail_wire: bool,
    wire_calls: usize,
}

#[derive(Clone, Debug)]
pub(crate) struct WiredIface {
    pub netns: String,
    pub ifname: String,
    pub mtu: u32,
    pub addresses: Vec<IpNetwork>,
}

impl FakeWiring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_wire(&self) {
        self.state.lock().unwrap().fail_wire = true;
    }

    pub fn wired(&self, host_ifname: &str) -> Option<WiredIface> {
        self.state.lock().unwrap().wired.get(host_ifname).cloned()
    }

    pub fn wired_count(&self) -> usize {
        self.state.lock().unwrap().wired.len()
    }

    pub fn wire_calls(&self) -> usize {
        self.state.lock().unwrap().wire_calls
    }

    pub fn unwire_calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().unwired.clone()
    }

    pub fn wire(&self, req: &WireRequest<'_>) -> Result<WireOutcome> {
        let mut state = self.state.lock().unwrap();
        state.wire_calls += 1;
        if state.fail_wire {
            state.fail_wire = false;
            return Err(Error::Wiring("injected wiring failure".into()));
        }
        state.wired.insert(
            req.host_ifname.to_owned(),
            WiredIface {
                netns: req.netns.to_owned(),
                ifname: req.ifname.to_owned(),
                mtu: req.mtu,
                addresses: req.addresses.to_vec(),
            },
        );
        Ok(WireOutcome {
            mac: FAKE_MAC.to_owned(),
        })
    }

    pub fn unwire(&self, netns: &str, ifname: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .wired
            .retain(|_, iface| !(iface.netns == netns && iface.ifname == ifname));
        state.unwired.push((netns.to_owned(), ifname.to_owned()));
        Ok(())
    }
}
