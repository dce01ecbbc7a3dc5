use tracing::{info, warn};

use calico_cni_datastore::Datastore;

use crate::config::Args;
use crate::identity::Identifiers;
use crate::ipam::{DelegateEnv, ExecDelegate, IpamDriver};
use crate::netlink::Wiring;
use crate::nodename;
use crate::response::Response;
use crate::types::Input;
use crate::{Error, Result};

pub fn delete(args: &Args, input: Input) -> Response {
    let cni_version = input.conf.cni_version.clone();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => return Error::from(e).into_response(cni_version),
    };
    match runtime.block_on(run(args, &input)) {
        Ok(()) => Response::Empty,
        Err(e) => e.into_response(cni_version),
    }
}

async fn run(args: &Args, input: &Input) -> Result<()> {
    input.conf.validate_name()?;
    let store = Datastore::connect(&input.conf.datastore_config()).await?;
    let nodename = nodename::resolve(&input.conf);
    run_delete(
        args,
        input,
        &nodename,
        &store,
        &IpamDriver::Exec(ExecDelegate),
        &Wiring::Netlink,
    )
    .await
}

/// Symmetric teardown: unwire the namespace, delete the endpoint, release
/// the IPAM reservation. The endpoint goes before the release so a crash in
/// between leaks at most a reservation, never an endpoint pointing at a
/// freed address.
pub(crate) async fn run_delete(
    args: &Args,
    input: &Input,
    nodename: &str,
    store: &Datastore,
    ipam: &IpamDriver,
    wiring: &Wiring,
) -> Result<()> {
    input.conf.validate_name()?;
    input.conf.validate_version()?;
    args.validate_for_delete()?;

    let ids = Identifiers::resolve(&args.cni_args(), &args.container_id, &args.ifname, nodename);
    let endpoint_name = ids.endpoint_name();
    info!(
        network = %input.conf.name,
        endpoint = %endpoint_name,
        container = %args.container_id,
        "removing workload"
    );

    let existing = store.get_endpoint(&ids.namespace, &endpoint_name).await?;
    if let Some(wep) = &existing {
        if wep.spec.container_id != args.container_id {
            // The pod was recreated and this DEL belongs to the old
            // generation; the current endpoint and its addresses stay.
            info!(
                stored = %wep.spec.container_id,
                "endpoint belongs to another container, nothing to do"
            );
            return Ok(());
        }
    } else {
        info!(endpoint = %endpoint_name, "no endpoint found for workload");
    }

    if args.netns.is_empty() {
        info!("no namespace path provided, skipping interface cleanup");
    } else {
        wiring.unwire(&args.netns, &args.ifname).await?;
    }

    if existing.is_some() {
        store
            .delete_endpoint(&ids.namespace, &endpoint_name, &args.container_id)
            .await?;
    }

    let delegate_env = DelegateEnv {
        container_id: &args.container_id,
        netns: &args.netns,
        ifname: &args.ifname,
        args: &args.args,
        path: &args.path,
    };
    if let Err(e) = ipam.release(&input.conf, &input.raw, &delegate_env).await {
        // The endpoint is gone; a failed release only leaks a reservation,
        // and a retried DEL will take the same path again.
        warn!(%e, "failed to release IPAM allocation");
    }

    info!(container = %args.container_id, "finished removing workload");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, FakeIpam, FakeWiring};
    use calico_cni_datastore::backend::MemoryStore;
    use calico_cni_datastore::endpoint::{
        WorkloadEndpoint, WorkloadEndpointSpec, ORCHESTRATOR_CNI,
    };

    const HOST_LOCAL_CONF: &str =
        r#"{"name": "net1", "type": "calico", "ipam": {"type": "host-local", "subnet": "10.0.0.0/8"}}"#;

    struct Harness {
        store: MemoryStore,
        ipam: FakeIpam,
        wiring: FakeWiring,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                ipam: FakeIpam::new(),
                wiring: FakeWiring::new(),
            }
        }

        async fn del(&self, args: &crate::config::Args, input: &Input) -> Result<()> {
            let store = calico_cni_datastore::Datastore::Memory(self.store.clone());
            run_delete(
                args,
                input,
                "node1",
                &store,
                &IpamDriver::Fake(self.ipam.clone()),
                &Wiring::Fake(self.wiring.clone()),
            )
            .await
        }

        fn seed_endpoint(&self, name: &str, container_id: &str) {
            let wep = WorkloadEndpoint::create(
                "default",
                name,
                WorkloadEndpointSpec {
                    interface_name: format!("cali{container_id}"),
                    ip_networks: vec!["10.0.0.2/32".into()],
                    node: "node1".into(),
                    endpoint: "eth0".into(),
                    container_id: container_id.into(),
                    orchestrator: ORCHESTRATOR_CNI.into(),
                    ..Default::default()
                },
            );
            self.store.create_or_update(&wep).unwrap();
        }
    }

    #[tokio::test]
    async fn delete_before_any_add_succeeds() {
        let h = Harness::new();
        let input = testutil::netconf(HOST_LOCAL_CONF);

        // With a namespace path and without one.
        h.del(&testutil::args("abc123", "/var/run/netns/a", ""), &input)
            .await
            .unwrap();
        h.del(&testutil::args("abc123", "", ""), &input).await.unwrap();
    }

    #[tokio::test]
    async fn stale_delete_leaves_the_endpoint_alone() {
        let h = Harness::new();
        let input = testutil::netconf(HOST_LOCAL_CONF);
        h.seed_endpoint("node1-cni-other-eth0", "other");

        // The endpoint name derives from the container ID for generic CNI,
        // so a stale DEL simply looks up nothing and succeeds.
        h.del(&testutil::args("abc123", "/var/run/netns/a", ""), &input)
            .await
            .unwrap();
        assert_eq!(h.store.endpoints().len(), 1);
    }

    #[tokio::test]
    async fn stale_delete_with_matching_name_checks_the_container_id() {
        let h = Harness::new();
        let input = testutil::netconf(HOST_LOCAL_CONF);
        // A pod recreation can leave an endpoint with this DEL's name but a
        // newer container ID.
        let args = testutil::k8s_args("X", "/var/run/netns/x", "test", "nginx");
        let wep = WorkloadEndpoint::create(
            "test",
            "node1-k8s-nginx-eth0",
            WorkloadEndpointSpec {
                interface_name: "caliabc".into(),
                pod: "nginx".into(),
                node: "node1".into(),
                endpoint: "eth0".into(),
                container_id: "Y".into(),
                orchestrator: "k8s".into(),
                ..Default::default()
            },
        );
        h.store.create_or_update(&wep).unwrap();

        h.del(&args, &input).await.unwrap();
        assert_eq!(h.store.endpoints().len(), 1);
        // Neither the namespace nor the allocation was touched.
        assert!(h.wiring.unwire_calls().is_empty());
        assert!(h.ipam.released().is_empty());
    }

    #[tokio::test]
    async fn empty_netns_skips_interface_cleanup() {
        let h = Harness::new();
        let input = testutil::netconf(HOST_LOCAL_CONF);
        h.seed_endpoint("node1-cni-abc123-eth0", "abc123");

        h.del(&testutil::args("abc123", "", ""), &input).await.unwrap();
        assert!(h.store.endpoints().is_empty());
        assert!(h.wiring.unwire_calls().is_empty());
    }

    #[tokio::test]
    async fn failed_ipam_release_is_not_fatal() {
        let h = Harness::new();
        // calico-ipam with a usePodCidr subnet gets no placeholder rewrite,
        // which the fake delegate rejects as unparseable.
        let input = testutil::netconf(
            r#"{"name": "net1", "type": "calico", "ipam": {"type": "calico-ipam", "subnet": "usePodCidr"}}"#,
        );
        h.seed_endpoint("node1-cni-abc123-eth0", "abc123");

        h.del(&testutil::args("abc123", "/var/run/netns/a", ""), &input)
            .await
            .unwrap();
        assert!(h.store.endpoints().is_empty());
    }
}
