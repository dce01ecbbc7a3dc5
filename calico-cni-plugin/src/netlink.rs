use std::fs::File;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::RouteScope;
use rtnetlink::{new_connection, Handle};
use tracing::{debug, info, warn};

use crate::netns::with_netns;
use crate::{Error, Result};

/// Link-local next hop advertised to every workload; the host side proxies
/// ARP for it.
pub const CONTAINER_GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

#[derive(Clone, Debug)]
pub struct WireRequest<'a> {
    pub host_ifname: &'a str,
    pub netns: &'a str,
    pub ifname: &'a str,
    pub mtu: u32,
    /// Host-masked (/32 or /128) addresses for the workload.
    pub addresses: &'a [IpNetwork],
}

#[derive(Clone, Debug)]
pub struct WireOutcome {
    /// MAC of the container-side interface.
    pub mac: String,
}

pub enum Wiring {
    Netlink,
    #[cfg(test)]
    Fake(crate::testutil::FakeWiring),
}

impl Wiring {
    pub async fn wire(&self, req: &WireRequest<'_>) -> Result<WireOutcome> {
        match self {
            Wiring::Netlink => wire(req).await,
            #[cfg(test)]
            Wiring::Fake(fake) => fake.wire(req),
        }
    }

    /// Remove the workload interface from its namespace. A missing interface
    /// or namespace is not an error; the kernel removes the host peer with
    /// it.
    pub async fn unwire(&self, netns: &str, ifname: &str) -> Result<()> {
        match self {
            Wiring::Netlink => unwire(netns, ifname),
            #[cfg(test)]
            Wiring::Fake(fake) => fake.unwire(netns, ifname),
        }
    }
}

async fn wire(req: &WireRequest<'_>) -> Result<WireOutcome> {
    let (connection, handle, _) =
        new_connection().map_err(|e| Error::Wiring(format!("netlink connection: {e}")))?;
    tokio::spawn(connection);

    // A link with our name means a prior ADD crashed partway; replace it.
    if let Some(link) = get_link(&handle, req.host_ifname).await? {
        info!(ifname = req.host_ifname, "replacing leftover host interface");
        handle
            .link()
            .del(link.header.index)
            .execute()
            .await
            .map_err(|e| {
                Error::Wiring(format!("failed to replace {}: {e}", req.host_ifname))
            })?;
    }

    let peer = temp_peer_name(req.host_ifname);
    if let Some(link) = get_link(&handle, &peer).await? {
        handle
            .link()
            .del(link.header.index)
            .execute()
            .await
            .map_err(|e| Error::Wiring(format!("failed to replace {peer}: {e}")))?;
    }

    debug!(host = req.host_ifname, peer = %peer, "creating veth pair");
    handle
        .link()
        .add()
        .veth(req.host_ifname.to_owned(), peer.clone())
        .execute()
        .await
        .map_err(|e| Error::Wiring(format!("failed to create veth pair: {e}")))?;

    let host_index = get_link(&handle, req.host_ifname)
        .await?
        .map(|l| l.header.index)
        .ok_or_else(|| Error::Wiring("veth created but host side not found".into()))?;
    let peer_index = get_link(&handle, &peer)
        .await?
        .map(|l| l.header.index)
        .ok_or_else(|| Error::Wiring("veth created but container side not found".into()))?;

    for index in [host_index, peer_index] {
        handle
            .link()
            .set(index)
            .mtu(req.mtu)
            .execute()
            .await
            .map_err(|e| Error::Wiring(format!("failed to set MTU {}: {e}", req.mtu)))?;
    }

    let netns_file = File::open(req.netns)
        .map_err(|e| Error::Netns(format!("failed to open namespace {}: {e}", req.netns)))?;
    handle
        .link()
        .set(peer_index)
        .setns_by_fd(netns_file.as_raw_fd())
        .execute()
        .await
        .map_err(|e| Error::Wiring(format!("failed to move veth into namespace: {e}")))?;

    handle
        .link()
        .set(host_index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::Wiring(format!("failed to bring host veth up: {e}")))?;

    configure_host_sysctls(req.host_ifname)?;

    let mac = {
        let peer = peer.clone();
        let ifname = req.ifname.to_owned();
        let mtu = req.mtu;
        let addresses = req.addresses.to_vec();
        with_netns(Path::new(req.netns), move || {
            configure_container(&peer, &ifname, mtu, &addresses)
        })?
    };

    // Traffic to the workload leaves through its veth; everything else is
    // the host agent's problem.
    for addr in req.addresses {
        add_host_route(&handle, host_index, addr).await?;
    }

    Ok(WireOutcome { mac })
}

fn temp_peer_name(host_ifname: &str) -> String {
    // "cali" -> "tmp" keeps the suffix unique and under IFNAMSIZ.
    format!("tmp{}", host_ifname.trim_start_matches("cali"))
}

/// Runs on a thread pinned inside the container namespace.
fn configure_container(
    peer: &str,
    ifname: &str,
    mtu: u32,
    addresses: &[IpNetwork],
) -> Result<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let (connection, handle, _) =
            new_connection().map_err(|e| Error::Wiring(format!("netlink connection: {e}")))?;
        tokio::spawn(connection);

        let index = get_link(&handle, peer)
            .await?
            .map(|l| l.header.index)
            .ok_or_else(|| Error::Wiring(format!("{peer} not found in container namespace")))?;

        handle
            .link()
            .set(index)
            .name(ifname.to_owned())
            .execute()
            .await
            .map_err(|e| Error::Wiring(format!("failed to rename {peer} to {ifname}: {e}")))?;
        handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| Error::Wiring(format!("failed to set MTU {mtu}: {e}")))?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::Wiring(format!("failed to bring {ifname} up: {e}")))?;

        for addr in addresses {
            match handle.address().add(index, addr.ip(), addr.prefix()).execute().await {
                Ok(()) => {}
                Err(e) if is_eexist(&e) => {
                    debug!(%addr, "address already present");
                }
                Err(e) => {
                    return Err(Error::Wiring(format!("failed to add address {addr}: {e}")))
                }
            }
        }

        if addresses.iter().any(|a| a.is_ipv4()) {
            // The gateway is link-scoped first so the default route through
            // it is accepted.
            match handle
                .route()
                .add()
                .v4()
                .destination_prefix(CONTAINER_GATEWAY, 32)
                .output_interface(index)
                .scope(RouteScope::Link)
                .execute()
                .await
            {
                Ok(()) => {}
                Err(e) if is_eexist(&e) => {}
                Err(e) => {
                    return Err(Error::Wiring(format!("failed to add gateway route: {e}")))
                }
            }
            match handle
                .route()
                .add()
                .v4()
                .gateway(CONTAINER_GATEWAY)
                .execute()
                .await
            {
                Ok(()) => {}
                Err(e) if is_eexist(&e) => {}
                Err(e) => {
                    return Err(Error::Wiring(format!("failed to add default route: {e}")))
                }
            }
        }

        let link = get_link(&handle, ifname)
            .await?
            .ok_or_else(|| Error::Wiring(format!("{ifname} disappeared during setup")))?;
        mac_of(&link).ok_or_else(|| Error::Wiring(format!("{ifname} has no MAC address")))
    })
}

async fn add_host_route(handle: &Handle, host_index: u32, addr: &IpNetwork) -> Result<()> {
    let result = match addr {
        IpNetwork::V4(net) => {
            handle
                .route()
                .add()
                .v4()
                .destination_prefix(net.ip(), net.prefix())
                .output_interface(host_index)
                .scope(RouteScope::Link)
                .execute()
                .await
        }
        IpNetwork::V6(net) => {
            handle
                .route()
                .add()
                .v6()
                .destination_prefix(net.ip(), net.prefix())
                .output_interface(host_index)
                .scope(RouteScope::Link)
                .execute()
                .await
        }
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if is_eexist(&e) => Ok(()),
        Err(e) => Err(Error::Wiring(format!("failed to add host route to {addr}: {e}"))),
    }
}

/// The host veth answers ARP for the link-local gateway and forwards for
/// the workload. IPv6 knobs are absent on v4-only hosts, which is fine.
fn configure_host_sysctls(ifname: &str) -> Result<()> {
    let v4: [(String, &str); 3] = [
        (format!("/proc/sys/net/ipv4/conf/{ifname}/proxy_arp"), "1"),
        (format!("/proc/sys/net/ipv4/neigh/{ifname}/proxy_delay"), "0"),
        (format!("/proc/sys/net/ipv4/conf/{ifname}/forwarding"), "1"),
    ];
    for (path, value) in &v4 {
        std::fs::write(path, value)
            .map_err(|e| Error::Wiring(format!("failed to set {path}: {e}")))?;
    }

    let v6: [(String, &str); 2] = [
        (format!("/proc/sys/net/ipv6/conf/{ifname}/forwarding"), "1"),
        (format!("/proc/sys/net/ipv6/conf/{ifname}/accept_ra"), "0"),
    ];
    for (path, value) in &v6 {
        if let Err(e) = std::fs::write(path, value) {
            debug!(%path, %e, "skipping IPv6 sysctl");
        }
    }
    Ok(())
}

fn unwire(netns: &str, ifname: &str) -> Result<()> {
    let outcome = with_netns(Path::new(netns), || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let (connection, handle, _) =
                new_connection().map_err(|e| Error::Wiring(format!("netlink connection: {e}")))?;
            tokio::spawn(connection);

            match get_link(&handle, ifname).await? {
                Some(link) => {
                    handle
                        .link()
                        .del(link.header.index)
                        .execute()
                        .await
                        .map_err(|e| Error::Wiring(format!("failed to delete {ifname}: {e}")))?;
                    info!(ifname, "deleted workload interface");
                }
                None => {
                    info!(ifname, "interface does not exist, nothing to clean up");
                }
            }
            Ok(())
        })
    });

    // A namespace that is already gone means the runtime tore it down first.
    match outcome {
        Err(Error::Netns(e)) => {
            warn!(%e, "namespace not accessible, skipping interface cleanup");
            Ok(())
        }
        other => other,
    }
}

async fn get_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle.link().get().match_name(name.to_owned()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
        Err(e) => Err(Error::Wiring(format!("failed to look up link {name}: {e}"))),
    }
}

fn is_eexist(e: &rtnetlink::Error) -> bool {
    matches!(e, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -libc::EEXIST)
}

fn mac_of(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => Some(
            bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
        ),
        _ => None,
    })
}
