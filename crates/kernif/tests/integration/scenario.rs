//! End-to-end flows.

use std::sync::Arc;

use kernif::kernel::types::{
    Algorithm, IpsecProtocol, PolicyAction, PolicyDirection, Removal, RouteEntry, SaDescriptor,
};
use kernif::kernel::{Backend, Capabilities, ReqidKey};
use kernif::lab::{LabIpsecBackend, LabNetworkBackend};
use kernif::{ErrorKind, KernelConfig, KernelInterface, Result};

use crate::common::{TestKernel, esp_sa, init_tracing, ip, protect, selector};

#[tokio::test]
async fn test_sa_and_route_lifecycle() -> Result<()> {
    init_tracing();
    let kernel = KernelInterface::new(KernelConfig::default())?;
    let ipsec = Arc::new(LabIpsecBackend::new("ipsec").with_capabilities(
        Capabilities::INSTALL_SA | Capabilities::DELETE_SA | Capabilities::QUERY_SA,
    ));
    let network =
        Arc::new(LabNetworkBackend::new("net").with_capabilities(Capabilities::ROUTE));
    kernel.register_backend(Backend::Ipsec(ipsec.clone()), 5).await?;
    kernel
        .register_backend(Backend::Network(network.clone()), 5)
        .await?;

    let sa = SaDescriptor::new(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp)
        .spi(0x1001)
        .reqid(1)
        .encryption(Algorithm::new("cbc(aes)", vec![0x42; 16]))
        .integrity(Algorithm::new("hmac(sha256)", vec![0x24; 32]));
    let id = kernel.install_sa(sa).await?;

    let route = RouteEntry::new("10.0.0.2/32".parse()?);
    kernel.add_route(route.clone()).await?;

    let info = kernel.query_sa(&id).await?;
    assert_eq!(info.id.dst, ip("10.0.0.2"));
    assert_eq!(info.id.spi, 0x1001);
    assert_eq!(info.id.protocol, IpsecProtocol::Esp);

    assert_eq!(kernel.delete_route(&route).await?, Removal::Removed);
    assert_eq!(kernel.delete_sa(&id).await?, Removal::Removed);

    let err = kernel.query_sa(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    kernel.shutdown().await;
    assert_eq!(ipsec.sa_count(), 0);
    assert!(network.routes().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_policies_with_different_templates() -> Result<()> {
    let t = TestKernel::new().await?;
    let first = protect(selector("10.1.0.0/16", "10.2.0.0/16"), "192.0.2.1", "198.51.100.1", 1);
    let second = protect(selector("10.1.0.0/16", "10.3.0.0/16"), "192.0.2.1", "198.51.100.2", 2);
    let (first_key, second_key) = (first.key(), second.key());

    t.kernel.install_policy(first).await?;
    t.kernel.install_policy(second).await?;
    assert_eq!(t.lab.ipsec.policy_count(), 2);

    let removed = t
        .kernel
        .delete_policy(&first_key.selector, PolicyDirection::Out)
        .await?;
    assert_eq!(removed, Removal::Removed);
    assert!(!t.lab.ipsec.has_policy(&first_key));
    assert!(t.lab.ipsec.has_policy(&second_key));

    let info = t
        .kernel
        .query_policy(&second_key.selector, PolicyDirection::Out)
        .await?;
    assert_eq!(info.key, second_key);

    assert_eq!(
        t.kernel
            .delete_policy(&first_key.selector, PolicyDirection::Out)
            .await?,
        Removal::NotFound
    );
    assert!(
        t.kernel
            .query_policy(&first_key.selector, PolicyDirection::Out)
            .await
            .unwrap_err()
            .is_not_found()
    );

    Ok(())
}

#[tokio::test]
async fn test_ambiguous_policy_rejected() -> Result<()> {
    let t = TestKernel::new().await?;
    let wide = protect(selector("10.1.0.0/16", "10.2.0.0/16"), "192.0.2.1", "198.51.100.1", 1);
    let narrow = protect(selector("10.1.2.0/24", "10.2.0.0/16"), "192.0.2.1", "198.51.100.2", 2);

    t.kernel.install_policy(wide).await?;
    let err = t.kernel.install_policy(narrow.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);

    // an explicit priority makes the order well defined
    t.kernel.install_policy(narrow.priority(100)).await?;
    assert_eq!(t.lab.ipsec.policy_count(), 2);

    t.kernel.flush_policies().await?;
    assert_eq!(t.lab.ipsec.policy_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_tunnel_setup_and_teardown() -> Result<()> {
    let t = TestKernel::new().await?;
    t.lab.network.add_interface("eth0", true);
    t.lab
        .network
        .add_system_address("eth0", ip("192.0.2.1"), 24);

    let local = t.kernel.source_address(ip("192.0.2.50"), None).await?;
    assert_eq!(local, ip("192.0.2.1"));

    let sel = selector("10.1.0.0/16", "10.2.0.0/16");
    let reqid = t.kernel.alloc_reqid(ReqidKey::new(vec![sel]))?;
    assert_eq!(t.kernel.alloc_reqid(ReqidKey::new(vec![sel]))?, reqid);

    let spi_in = t
        .kernel
        .get_spi(ip("192.0.2.50"), local, IpsecProtocol::Esp)
        .await?;
    let inbound = t
        .kernel
        .install_sa(esp_sa("192.0.2.50", "192.0.2.1").spi(spi_in).reqid(reqid).inbound(true))
        .await?;
    let outbound = t
        .kernel
        .install_sa(esp_sa("192.0.2.1", "192.0.2.50").reqid(reqid))
        .await?;
    assert_ne!(inbound, outbound);

    let policy = protect(sel, "192.0.2.1", "192.0.2.50", reqid);
    assert!(matches!(&policy.action, PolicyAction::Protect(templates) if templates.len() == 1));
    t.kernel.install_policy(policy).await?;
    t.kernel
        .add_route(
            RouteEntry::new("10.2.0.0/16".parse()?)
                .src(ip("10.1.0.1"))
                .dev("eth0"),
        )
        .await?;

    t.lab.ipsec.record_traffic(&outbound, 4096, 4);
    let used = t
        .kernel
        .query_policy(&sel, PolicyDirection::Out)
        .await?;
    assert!(used.idle.is_some());

    // teardown in reverse
    t.kernel.delete_policy(&sel, PolicyDirection::Out).await?;
    t.kernel.delete_sa(&outbound).await?;
    t.kernel.delete_sa(&inbound).await?;
    t.kernel.release_reqid(reqid)?;
    t.kernel.release_reqid(reqid)?;
    assert!(t.kernel.release_reqid(reqid).is_err());

    t.kernel.shutdown().await;
    assert_eq!(t.lab.ipsec.sa_count(), 0);
    assert_eq!(t.lab.ipsec.policy_count(), 0);
    assert!(t.lab.network.routes().is_empty());

    Ok(())
}
