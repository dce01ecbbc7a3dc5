use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use calico_cni_datastore::endpoint::{WorkloadEndpoint, WorkloadEndpointSpec};
use calico_cni_datastore::Datastore;

use crate::annotations::{IpOverrides, PodSource};
use crate::config::Args;
use crate::identity::{Identifiers, Orchestrator};
use crate::ipam::{DelegateEnv, ExecDelegate, IpamDriver};
use crate::netlink::{WireRequest, Wiring, CONTAINER_GATEWAY};
use crate::nodename;
use crate::response::{Response, Success};
use crate::types::{host_network, Input, Interface, Ip, NetConf, Route};
use crate::{Error, Result};

const PUBLISH_ATTEMPTS: usize = 3;

pub fn add(args: &Args, input: Input) -> Response {
    let cni_version = input.conf.cni_version.clone();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => return Error::from(e).into_response(cni_version),
    };
    match runtime.block_on(run(args, &input)) {
        Ok(success) => Response::Success(success),
        Err(e) => e.into_response(cni_version),
    }
}

async fn run(args: &Args, input: &Input) -> Result<Success> {
    input.conf.validate_name()?;
    let store = Datastore::connect(&input.conf.datastore_config()).await?;
    let nodename = nodename::resolve(&input.conf);

    let cni_args = args.cni_args();
    let ids = Identifiers::resolve(&cni_args, &args.container_id, &args.ifname, &nodename);
    let pods = match ids.orchestrator {
        Orchestrator::K8s => Some(PodSource::Kube(
            calico_cni_datastore::backend::kubernetes::client(&input.conf.datastore_config())
                .await?,
        )),
        Orchestrator::Cni => None,
    };

    run_add(
        args,
        input,
        &nodename,
        &store,
        pods.as_ref(),
        &IpamDriver::Exec(ExecDelegate),
        &Wiring::Netlink,
    )
    .await
}

/// The ADD state machine: validate, resolve identity, delegate IPAM, wire
/// the namespace, publish the endpoint. Failures after IPAM succeeded run a
/// compensating release so no allocation outlives the attempt.
pub(crate) async fn run_add(
    args: &Args,
    input: &Input,
    nodename: &str,
    store: &Datastore,
    pods: Option<&PodSource>,
    ipam: &IpamDriver,
    wiring: &Wiring,
) -> Result<Success> {
    input.conf.validate_name()?;
    input.conf.validate_version()?;
    args.validate_for_add()?;

    let ids = Identifiers::resolve(&args.cni_args(), &args.container_id, &args.ifname, nodename);
    let endpoint_name = ids.endpoint_name();
    let host_ifname = ids.host_veth_name();
    info!(
        network = %input.conf.name,
        endpoint = %endpoint_name,
        orchestrator = ids.orchestrator.as_str(),
        container = %args.container_id,
        "configuring workload"
    );

    // One endpoint per workload: an ADD for a container we already know is
    // answered from the stored state, and an ADD for a new container
    // supersedes whatever generation came before it.
    let existing = match ids.orchestrator {
        Orchestrator::K8s => store.list_by_pod(&ids.namespace, &ids.pod).await?,
        Orchestrator::Cni => store
            .get_endpoint(&ids.namespace, &endpoint_name)
            .await?
            .into_iter()
            .collect(),
    };

    for wep in &existing {
        if wep.spec.container_id == args.container_id {
            info!(
                endpoint = wep.name(),
                "endpoint already exists for this container, returning stored state"
            );
            return result_from_endpoint(&input.conf, args, wep);
        }
    }

    let delegate_env = DelegateEnv {
        container_id: &args.container_id,
        netns: &args.netns,
        ifname: &args.ifname,
        args: &args.args,
        path: &args.path,
    };

    for stale in &existing {
        info!(
            endpoint = stale.name(),
            old_container = %stale.spec.container_id,
            "pod has been recreated, retiring stale endpoint"
        );
        store
            .delete_endpoint(&ids.namespace, stale.name(), &stale.spec.container_id)
            .await?;
        let stale_env = DelegateEnv {
            container_id: &stale.spec.container_id,
            ..delegate_env.clone()
        };
        if let Err(e) = ipam.release(&input.conf, &input.raw, &stale_env).await {
            warn!(%e, "failed to release allocation for superseded container");
        }
    }

    let (overrides, ports) = match ids.orchestrator {
        Orchestrator::K8s => {
            let source = pods.ok_or_else(|| {
                Error::InvalidNetworkConfig(
                    "kubernetes workload but no API access is configured".into(),
                )
            })?;
            let pod_info = source.pod_info(&ids.namespace, &ids.pod).await?;
            (
                IpOverrides::from_annotations(&pod_info.annotations)?,
                pod_info.ports,
            )
        }
        Orchestrator::Cni => (IpOverrides::default(), Vec::new()),
    };

    let (result_ips, ipam_allocated) =
        assign_addresses(input, ipam, &delegate_env, &overrides).await?;
    let networks: Vec<IpNetwork> = result_ips.iter().map(Ip::host_network).collect();

    let wire_req = WireRequest {
        host_ifname: &host_ifname,
        netns: &args.netns,
        ifname: &args.ifname,
        mtu: input.conf.mtu(),
        addresses: &networks,
    };
    let outcome = match wiring.wire(&wire_req).await {
        Ok(outcome) => outcome,
        Err(e) => {
            release_for_failed_add(input, ipam, &delegate_env, ipam_allocated).await;
            return Err(e);
        }
    };

    let profiles = match ids.orchestrator {
        Orchestrator::K8s => vec![format!("kns.{}", ids.namespace)],
        Orchestrator::Cni => {
            if let Err(e) = store.ensure_profile(&input.conf.name).await {
                let _ = wiring.unwire(&args.netns, &args.ifname).await;
                release_for_failed_add(input, ipam, &delegate_env, ipam_allocated).await;
                return Err(e.into());
            }
            vec![input.conf.name.clone()]
        }
    };

    let wep = WorkloadEndpoint::create(
        &ids.namespace,
        &endpoint_name,
        WorkloadEndpointSpec {
            pod: ids.pod.clone(),
            interface_name: host_ifname.clone(),
            ip_networks: networks.iter().map(|n| n.to_string()).collect(),
            mac: Some(outcome.mac.clone()),
            profiles,
            node: ids.node.clone(),
            endpoint: ids.endpoint.clone(),
            workload: String::new(),
            container_id: ids.container_id.clone(),
            orchestrator: ids.orchestrator.as_str().to_owned(),
            ports,
        },
    );

    if let Err(e) = publish(store, wep).await {
        let _ = wiring.unwire(&args.netns, &args.ifname).await;
        release_for_failed_add(input, ipam, &delegate_env, ipam_allocated).await;
        return Err(e);
    }

    info!(container = %args.container_id, "finished networking workload");
    Ok(build_result(&input.conf, args, result_ips, Some(&outcome.mac)))
}

/// Pick addresses per the pod's annotations: bypass IPAM entirely, pin
/// specific addresses through the delegate, restrict its pools, or just run
/// it as configured. Returns whether the delegate actually allocated
/// anything, which decides whether a later failure needs compensation.
async fn assign_addresses(
    input: &Input,
    ipam: &IpamDriver,
    env: &DelegateEnv<'_>,
    overrides: &IpOverrides,
) -> Result<(Vec<Ip>, bool)> {
    if !overrides.bypass.is_empty() {
        info!(addresses = ?overrides.bypass, "assigning addresses without IPAM");
        let ips = overrides
            .bypass
            .iter()
            .map(|addr| Ip::new(host_network(*addr)))
            .collect();
        return Ok((ips, false));
    }

    if !overrides.specific.is_empty() {
        let mut ips = Vec::new();
        for addr in &overrides.specific {
            let stdin = crate::ipam::with_assigned_ip(&input.raw, *addr)?;
            match ipam.assign(&input.conf, &stdin, env).await {
                Ok(result) => ips.extend(result.ips),
                Err(e) => {
                    // Earlier addresses in the list are already reserved
                    // under this container's handle.
                    if !ips.is_empty() {
                        release_for_failed_add(input, ipam, env, true).await;
                    }
                    return Err(e);
                }
            }
        }
        return Ok((ips, true));
    }

    let stdin = if overrides.v4_pools.is_empty() && overrides.v6_pools.is_empty() {
        input.raw.clone()
    } else {
        crate::ipam::with_pools(&input.raw, &overrides.v4_pools, &overrides.v6_pools)?
    };
    let result = ipam.assign(&input.conf, &stdin, env).await?;
    Ok((result.ips, true))
}

async fn release_for_failed_add(
    input: &Input,
    ipam: &IpamDriver,
    env: &DelegateEnv<'_>,
    allocated: bool,
) {
    if !allocated {
        return;
    }
    info!("cleaning up IP allocations for failed ADD");
    if let Err(e) = ipam.release(&input.conf, &input.raw, env).await {
        warn!(%e, "failed to clean up IP allocations for failed ADD");
    }
}

async fn publish(store: &Datastore, mut wep: WorkloadEndpoint) -> Result<()> {
    let mut attempt = 0;
    loop {
        match store.create_or_update(&wep).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() => {
                attempt += 1;
                if attempt >= PUBLISH_ATTEMPTS {
                    return Err(e.into());
                }
                debug!(attempt, endpoint = wep.name(), "endpoint write conflicted, re-reading");
                let refreshed = store.get_endpoint(wep.namespace(), wep.name()).await?;
                wep.metadata.resource_version =
                    refreshed.and_then(|w| w.metadata.resource_version);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A repeat ADD answers with the stored endpoint's state so the runtime
/// sees the same result it got the first time.
fn result_from_endpoint(conf: &NetConf, args: &Args, wep: &WorkloadEndpoint) -> Result<Success> {
    let mut ips = Vec::new();
    for net in &wep.spec.ip_networks {
        let address: IpNetwork = net
            .parse()
            .map_err(|e| Error::Parse(format!("stored endpoint address {net:?}: {e}")))?;
        ips.push(Ip::new(address));
    }
    Ok(build_result(conf, args, ips, wep.spec.mac.as_deref()))
}

fn build_result(conf: &NetConf, args: &Args, mut ips: Vec<Ip>, mac: Option<&str>) -> Success {
    for ip in &mut ips {
        ip.address = ip.host_network();
        ip.version = Some(if ip.address.is_ipv4() { "4" } else { "6" }.into());
        ip.interface = Some(0);
        ip.gateway = if ip.address.is_ipv4() {
            Some(IpAddr::V4(CONTAINER_GATEWAY))
        } else {
            None
        };
    }

    let mut routes = Vec::new();
    if ips.iter().any(|ip| ip.address.is_ipv4()) {
        routes.push(Route {
            dst: IpNetwork::V4(ipnetwork::Ipv4Network::new([0, 0, 0, 0].into(), 0).unwrap()),
            gw: Some(IpAddr::V4(CONTAINER_GATEWAY)),
        });
        routes.push(Route {
            dst: host_network(IpAddr::V4(CONTAINER_GATEWAY)),
            gw: None,
        });
    }

    Success {
        cni_version: conf.cni_version.clone(),
        interfaces: vec![Interface {
            name: args.ifname.clone(),
            mac: mac.map(str::to_owned),
            sandbox: Some(args.netns.clone().into()),
        }],
        ips,
        routes,
        dns: None,
    }
}
