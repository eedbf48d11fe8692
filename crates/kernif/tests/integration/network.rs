//! Routes, addresses, interfaces and shutdown cleanup.

use kernif::kernel::types::{AddressEntry, AddressFilter, Removal, RouteEntry};
use kernif::lab::LabKernel;
use kernif::{Error, ErrorKind, KernelConfig, KernelInterface, Result};

use crate::common::{TestKernel, esp_sa, init_tracing, ip, protect, selector};

fn route(dst: &str) -> RouteEntry {
    RouteEntry::new(dst.parse().expect("valid prefix"))
        .src(ip("192.168.1.10"))
        .dev("eth0")
}

async fn with_eth0(config: KernelConfig) -> Result<TestKernel> {
    let t = TestKernel::with_config(config).await?;
    t.lab.network.add_interface("eth0", true);
    t.lab
        .network
        .add_system_address("eth0", ip("192.168.1.10"), 24);
    Ok(t)
}

fn sorted(mut addrs: Vec<std::net::IpAddr>) -> Vec<std::net::IpAddr> {
    addrs.sort();
    addrs
}

#[tokio::test]
async fn test_route_add_and_delete() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    let r = route("10.0.0.2/32");

    t.kernel.add_route(r.clone()).await?;
    assert!(t.lab.network.has_route(&r));
    assert!(t.kernel.owns_route(&r));

    // same destination in another table is a different route
    let main = r.clone().table(254);
    t.kernel.add_route(main.clone()).await?;
    assert_eq!(t.lab.network.routes().len(), 2);

    assert_eq!(t.kernel.delete_route(&r).await?, Removal::Removed);
    assert!(!t.kernel.owns_route(&r));
    assert!(t.lab.network.has_route(&main));
    assert_eq!(t.kernel.delete_route(&r).await?, Removal::NotFound);

    Ok(())
}

#[tokio::test]
async fn test_route_on_missing_interface() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    let r = RouteEntry::new("10.0.0.2/32".parse()?).dev("wg9");

    let err = t.kernel.add_route(r.clone()).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("installing route"));
    assert!(!t.kernel.owns_route(&r));

    Ok(())
}

#[tokio::test]
async fn test_route_delete_by_value_after_restart() -> Result<()> {
    init_tracing();
    let lab = LabKernel::new();
    lab.network.add_interface("eth0", true);
    let r = route("10.0.0.2/32");

    {
        let first = KernelInterface::new(KernelConfig::default())?;
        lab.register(&first, 0).await?;
        first.add_route(r.clone()).await?;
        // dropped without shutdown, the route stays behind
    }
    assert!(lab.network.has_route(&r));

    let second = KernelInterface::new(KernelConfig::default())?;
    lab.register(&second, 0).await?;
    assert!(!second.owns_route(&r));
    assert_eq!(second.delete_route(&r).await?, Removal::Removed);
    assert!(!lab.network.has_route(&r));

    Ok(())
}

#[tokio::test]
async fn test_existing_route_is_not_owned() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    let r = route("10.0.0.2/32");
    t.lab.network.add_system_route(r.clone());

    t.kernel.add_route(r.clone()).await?;
    assert!(!t.kernel.owns_route(&r));

    t.kernel.shutdown().await;
    assert!(t.lab.network.has_route(&r));

    Ok(())
}

#[tokio::test]
async fn test_shutdown_removes_owned_resources() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    let r = route("10.0.0.2/32");
    let vip = AddressEntry::new("eth0", ip("10.3.0.1"));
    let policy = protect(
        selector("10.3.0.1/32", "10.2.0.0/16"),
        "192.168.1.10",
        "10.0.0.2",
        1,
    );
    let key = policy.key();

    t.kernel.add_route(r.clone()).await?;
    t.kernel.add_address(vip.clone()).await?;
    t.kernel.install_policy(policy).await?;
    let sa = t
        .kernel
        .install_sa(esp_sa("192.168.1.10", "10.0.0.2").spi(0xc000_1001))
        .await?;

    t.kernel.shutdown().await;

    assert!(!t.lab.network.has_route(&r));
    assert!(!t.lab.network.has_address(vip.address));
    assert!(!t.lab.ipsec.has_policy(&key));
    // SAs belong to their callers
    assert!(t.lab.ipsec.has_sa(&sa));
    // the system address is left alone
    assert!(t.lab.network.has_address(ip("192.168.1.10")));

    Ok(())
}

#[tokio::test]
async fn test_shutdown_continues_after_failure() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    let a = route("10.0.0.2/32");
    let b = route("10.0.0.3/32");
    let vip = AddressEntry::new("eth0", ip("10.3.0.1"));

    t.kernel.add_route(a.clone()).await?;
    t.kernel.add_route(b.clone()).await?;
    t.kernel.add_address(vip.clone()).await?;

    t.lab.network.fail_next(Error::from_errno(-libc::EPERM));
    t.kernel.shutdown().await;

    let left = t.lab.network.routes();
    assert_eq!(left.len(), 1);
    assert!(left[0] == a || left[0] == b);
    assert!(!t.lab.network.has_address(vip.address));

    Ok(())
}

#[tokio::test]
async fn test_addresses_are_owned_only_when_created() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    let existing = AddressEntry::new("eth0", ip("192.168.1.10")).prefix_len(24);
    let vip = AddressEntry::new("eth0", ip("10.3.0.1"));

    t.kernel.add_address(existing.clone()).await?;
    t.kernel.add_address(vip.clone()).await?;

    let err = t
        .kernel
        .add_address(AddressEntry::new("wg9", ip("10.3.0.2")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    t.kernel.shutdown().await;
    assert!(t.lab.network.has_address(existing.address));
    assert!(!t.lab.network.has_address(vip.address));

    Ok(())
}

#[tokio::test]
async fn test_delete_address() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    let vip = AddressEntry::new("eth0", ip("10.3.0.1"));

    t.kernel.add_address(vip.clone()).await?;
    assert_eq!(t.kernel.delete_address(&vip).await?, Removal::Removed);
    assert_eq!(t.kernel.delete_address(&vip).await?, Removal::NotFound);

    Ok(())
}

#[tokio::test]
async fn test_interfaces_and_state() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    t.lab.network.add_interface("eth1", false);

    let names: Vec<_> = t
        .kernel
        .interfaces()
        .await?
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(names, ["lo", "eth0", "eth1"]);

    assert!(t.kernel.interface_state("eth0").await?.up);
    assert!(!t.kernel.interface_state("eth1").await?.up);
    assert!(t.kernel.interface_state("eth7").await.unwrap_err().is_not_found());

    Ok(())
}

#[tokio::test]
async fn test_enumerate_addresses() -> Result<()> {
    let t = with_eth0(KernelConfig::new().interfaces_ignore(["docker0"])).await?;
    t.lab.network.add_interface("eth1", false);
    t.lab
        .network
        .add_system_address("eth1", ip("192.168.2.10"), 24);
    t.lab.network.add_interface("docker0", true);
    t.lab
        .network
        .add_system_address("docker0", ip("172.17.0.1"), 16);
    t.kernel
        .add_address(AddressEntry::new("eth0", ip("10.3.0.1")))
        .await?;

    let list = |filter: AddressFilter| {
        let kernel = t.kernel.clone();
        async move {
            kernel
                .enumerate_addresses(&filter)
                .await
                .map(|a| sorted(a.into_iter().map(|a| a.address).collect()))
        }
    };

    assert_eq!(list(AddressFilter::new()).await?, [ip("192.168.1.10")]);
    assert_eq!(list(AddressFilter::virtual_only()).await?, [ip("10.3.0.1")]);
    assert_eq!(
        list(AddressFilter::new().down(true)).await?,
        [ip("192.168.1.10"), ip("192.168.2.10")]
    );
    assert_eq!(
        list(AddressFilter::new().ignored(true)).await?,
        [ip("172.17.0.1"), ip("192.168.1.10")]
    );
    assert_eq!(
        list(AddressFilter::new().interface("eth1").down(true)).await?,
        [ip("192.168.2.10")]
    );
    assert_eq!(list(AddressFilter::all()).await?.len(), 6);

    let info = t
        .kernel
        .enumerate_addresses(&AddressFilter::virtual_only())
        .await?;
    assert_eq!(info[0].interface, "eth0");
    assert!(info[0].virtual_ip);

    Ok(())
}

#[tokio::test]
async fn test_interface_for() -> Result<()> {
    let t = with_eth0(KernelConfig::new().interfaces_ignore(["docker0"])).await?;
    t.lab.network.add_interface("docker0", true);
    t.lab
        .network
        .add_system_address("docker0", ip("172.17.0.1"), 16);

    assert_eq!(
        t.kernel.interface_for(ip("192.168.1.10")).await?.as_deref(),
        Some("eth0")
    );
    assert_eq!(t.kernel.interface_for(ip("172.17.0.1")).await?, None);
    assert_eq!(t.kernel.interface_for(ip("192.0.2.1")).await?, None);

    Ok(())
}

#[tokio::test]
async fn test_route_lookups() -> Result<()> {
    let t = with_eth0(KernelConfig::default()).await?;
    t.lab.network.add_system_route(
        RouteEntry::new("0.0.0.0/0".parse()?)
            .via(ip("192.168.1.1"))
            .dev("eth0")
            .table(254),
    );
    t.lab
        .network
        .add_system_route(RouteEntry::new("192.168.1.0/24".parse()?).dev("eth0").table(254));
    let remote = ip("203.0.113.5");

    assert_eq!(t.kernel.next_hop(remote, None).await?, Some(ip("192.168.1.1")));
    assert_eq!(t.kernel.next_hop(ip("192.168.1.20"), None).await?, None);
    assert_eq!(
        t.kernel.source_address(remote, None).await?,
        ip("192.168.1.10")
    );

    // a usable hint wins, an unknown one is ignored
    t.kernel
        .add_address(AddressEntry::new("eth0", ip("10.3.0.1")))
        .await?;
    assert_eq!(
        t.kernel.source_address(remote, Some(ip("10.3.0.1"))).await?,
        ip("10.3.0.1")
    );
    assert_eq!(
        t.kernel.source_address(remote, Some(ip("10.9.9.9"))).await?,
        ip("192.168.1.10")
    );

    let err = t
        .kernel
        .next_hop(ip("2001:db8::1"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);

    Ok(())
}
