//! Listener registry and event fan-out.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use kernif::kernel::events::{ExpireEvent, MappingEvent, MigrateEvent};
use kernif::kernel::types::{AddressEntry, IpsecProtocol, Lifetime, PolicyDirection, SaId};
use kernif::kernel::{KernelEvent, KernelListener, ListenerId, Notification};
use kernif::{KernelConfig, KernelInterface, Result};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use crate::common::{ChannelListener, TestKernel, assert_quiet, esp_sa, ip, next_event, selector};

fn sa_id(spi: u32) -> SaId {
    SaId::new(ip("10.0.0.2"), IpsecProtocol::Esp, spi)
}

fn expect_expire(event: Option<KernelEvent>) -> ExpireEvent {
    match event {
        Some(KernelEvent::SaExpired(e)) => e,
        other => panic!("expected expire, got {:?}", other),
    }
}

struct Panicky;

impl KernelListener for Panicky {
    fn expire(&self, _event: &ExpireEvent) {
        panic!("listener bug");
    }
}

/// Unregisters itself from inside its first callback.
struct OneShot {
    kernel: Weak<KernelInterface>,
    id: OnceLock<ListenerId>,
    tx: mpsc::UnboundedSender<ExpireEvent>,
}

impl KernelListener for OneShot {
    fn expire(&self, event: &ExpireEvent) {
        let _ = self.tx.send(event.clone());
        if let (Some(kernel), Some(id)) = (self.kernel.upgrade(), self.id.get()) {
            assert!(kernel.unregister_listener(*id));
        }
    }
}

#[tokio::test]
async fn test_expire_reaches_listener() -> Result<()> {
    let t = TestKernel::new().await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);

    let id = t
        .kernel
        .install_sa(
            esp_sa("10.0.0.1", "10.0.0.2")
                .spi(0xc000_1001)
                .reqid(7)
                .lifetime(Lifetime::unlimited().bytes(1000, 2000)),
        )
        .await?;

    t.lab.ipsec.record_traffic(&id, 1200, 1);
    let soft = expect_expire(next_event(&mut rx).await);
    assert_eq!(soft.id, id);
    assert_eq!(soft.reqid, 7);
    assert!(!soft.hard);

    // soft expiry is raised once
    t.lab.ipsec.record_traffic(&id, 100, 1);
    assert_quiet(&mut rx).await;

    t.lab.ipsec.record_traffic(&id, 1000, 1);
    let hard = expect_expire(next_event(&mut rx).await);
    assert!(hard.hard);
    assert!(!t.lab.ipsec.has_sa(&id));

    Ok(())
}

#[tokio::test]
async fn test_lifetime_events_disabled() -> Result<()> {
    let t = TestKernel::new().await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);

    let id = t
        .kernel
        .install_sa(
            esp_sa("10.0.0.1", "10.0.0.2")
                .spi(0xc000_1001)
                .lifetime(Lifetime::unlimited().packets(1, 2)),
        )
        .await?;
    t.kernel.set_lifetime_events(false).await?;

    t.lab.ipsec.record_traffic(&id, 64, 1);
    assert_quiet(&mut rx).await;

    Ok(())
}

#[tokio::test]
async fn test_no_events_after_unregister() -> Result<()> {
    let t = TestKernel::new().await?;
    let (target, mut target_rx) = ChannelListener::new();
    let (witness, mut witness_rx) = ChannelListener::new();
    let target_id = t.kernel.register_listener(target);
    t.kernel.register_listener(witness);

    t.lab.ipsec.expire(&sa_id(0xc000_1001), true);
    assert!(next_event(&mut target_rx).await.is_some());
    assert!(next_event(&mut witness_rx).await.is_some());

    assert!(t.kernel.unregister_listener(target_id));
    assert!(!t.kernel.unregister_listener(target_id));

    t.lab.ipsec.expire(&sa_id(0xc000_1002), true);
    // the witness sees it after the target would have
    let seen = expect_expire(next_event(&mut witness_rx).await);
    assert_eq!(seen.id.spi, 0xc000_1002);
    assert!(target_rx.try_recv().is_err());

    Ok(())
}

#[tokio::test]
async fn test_listener_unregisters_itself() -> Result<()> {
    let t = TestKernel::new().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let one_shot = Arc::new(OneShot {
        kernel: Arc::downgrade(&t.kernel),
        id: OnceLock::new(),
        tx,
    });
    let id = t.kernel.register_listener(one_shot.clone());
    let _ = one_shot.id.set(id);
    let (witness, mut witness_rx) = ChannelListener::new();
    t.kernel.register_listener(witness);

    t.lab.ipsec.expire(&sa_id(0xc000_1001), false);
    t.lab.ipsec.expire(&sa_id(0xc000_1002), false);
    next_event(&mut witness_rx).await;
    next_event(&mut witness_rx).await;

    let first = rx.recv().await.expect("first delivery");
    assert_eq!(first.id.spi, 0xc000_1001);
    assert!(rx.try_recv().is_err());

    Ok(())
}

#[tokio::test]
async fn test_panicking_listener_does_not_stop_delivery() -> Result<()> {
    let t = TestKernel::new().await?;
    t.kernel.register_listener(Arc::new(Panicky));
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);

    t.lab.ipsec.expire(&sa_id(0xc000_1001), true);
    t.lab.ipsec.expire(&sa_id(0xc000_1002), true);

    assert_eq!(expect_expire(next_event(&mut rx).await).id.spi, 0xc000_1001);
    assert_eq!(expect_expire(next_event(&mut rx).await).id.spi, 0xc000_1002);

    Ok(())
}

#[tokio::test]
async fn test_listeners_called_in_registration_order() -> Result<()> {
    let t = TestKernel::new().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    struct Tagged(&'static str, mpsc::UnboundedSender<&'static str>);
    impl KernelListener for Tagged {
        fn mapping(&self, _event: &MappingEvent) {
            let _ = self.1.send(self.0);
        }
    }

    for tag in ["first", "second", "third"] {
        t.kernel.register_listener(Arc::new(Tagged(tag, tx.clone())));
    }
    t.lab
        .ipsec
        .mapping(&sa_id(0xc000_1001), ip("198.51.100.7"), 4501);

    let mut order = Vec::new();
    for _ in 0..3 {
        let tag = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
            .expect("callback ran");
        order.push(tag);
    }
    assert_eq!(order, ["first", "second", "third"]);

    Ok(())
}

#[tokio::test]
async fn test_acquire_classification() -> Result<()> {
    let t = TestKernel::new().await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);
    let sel = selector("10.1.0.0/16", "10.2.0.0/16");

    t.lab
        .ipsec
        .acquire(5, Some(sel), Some(ip("10.1.0.7")), Some(ip("10.2.0.9")));
    match next_event(&mut rx).await {
        Some(KernelEvent::SaAcquire(a)) => {
            assert_eq!(a.reqid, 5);
            assert_eq!(a.selector, Some(sel));
            assert_eq!(a.dst, Some(ip("10.2.0.9")));
        }
        other => panic!("expected SA acquire, got {:?}", other),
    }

    t.lab.ipsec.acquire(0, Some(sel), None, None);
    assert!(matches!(
        next_event(&mut rx).await,
        Some(KernelEvent::PolicyAcquire(a)) if a.reqid == 0
    ));

    Ok(())
}

#[tokio::test]
async fn test_mapping_and_migrate() -> Result<()> {
    let t = TestKernel::new().await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);

    t.lab
        .ipsec
        .mapping(&sa_id(0xc000_1001), ip("198.51.100.7"), 4501);
    match next_event(&mut rx).await {
        Some(KernelEvent::Mapping(m)) => {
            assert_eq!(m.id, sa_id(0xc000_1001));
            assert_eq!(m.remote, ip("198.51.100.7"));
            assert_eq!(m.port, 4501);
        }
        other => panic!("expected mapping, got {:?}", other),
    }

    let migrate = MigrateEvent {
        reqid: 3,
        selector: selector("10.1.0.0/16", "10.2.0.0/16"),
        direction: PolicyDirection::Out,
        local: ip("192.0.2.10"),
        remote: ip("198.51.100.7"),
    };
    t.lab.ipsec.emit(Notification::Migrate(migrate.clone()));
    assert_eq!(
        next_event(&mut rx).await,
        Some(KernelEvent::RouteMigrate(migrate))
    );

    Ok(())
}

#[tokio::test]
async fn test_interface_transitions_only() -> Result<()> {
    let t = TestKernel::with_config(KernelConfig::new().interfaces_ignore(["docker0"])).await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);

    let index = t.lab.network.add_interface("eth0", true);
    match next_event(&mut rx).await {
        Some(KernelEvent::InterfaceUp(i)) => {
            assert_eq!(i.name, "eth0");
            assert_eq!(i.index, index);
        }
        other => panic!("expected interface up, got {:?}", other),
    }

    // ignored interface, then a repeated state
    t.lab.network.add_interface("docker0", true);
    t.lab.network.set_link("eth0", true);
    t.lab.network.set_link("eth0", false);
    assert!(matches!(
        next_event(&mut rx).await,
        Some(KernelEvent::InterfaceDown(i)) if i.name == "eth0"
    ));

    // an interface that is down when it appears produces nothing
    t.lab.network.add_interface("eth1", false);
    t.lab.network.set_link("eth0", true);
    assert!(matches!(
        next_event(&mut rx).await,
        Some(KernelEvent::InterfaceUp(i)) if i.name == "eth0"
    ));

    t.lab.network.remove_interface("eth0");
    assert!(matches!(
        next_event(&mut rx).await,
        Some(KernelEvent::InterfaceDown(i)) if i.name == "eth0"
    ));

    Ok(())
}

#[tokio::test]
async fn test_address_events() -> Result<()> {
    let t = TestKernel::with_config(KernelConfig::new().interfaces_ignore(["docker0"])).await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);
    t.lab.network.add_interface("docker0", true);
    t.lab.network.add_interface("eth0", true);
    assert!(matches!(
        next_event(&mut rx).await,
        Some(KernelEvent::InterfaceUp(i)) if i.name == "eth0"
    ));

    t.lab
        .network
        .add_system_address("docker0", ip("172.17.0.1"), 16);
    t.lab
        .network
        .add_system_address("eth0", ip("192.168.1.10"), 24);
    match next_event(&mut rx).await {
        Some(KernelEvent::AddressAdded(a)) => {
            assert_eq!(a.address, ip("192.168.1.10"));
            assert_eq!(a.prefix_len, 24);
            assert_eq!(a.interface, "eth0");
            assert!(!a.virtual_ip);
        }
        other => panic!("expected address added, got {:?}", other),
    }

    let vip = AddressEntry::new("eth0", ip("10.3.0.1"));
    t.kernel.add_address(vip.clone()).await?;
    assert!(matches!(
        next_event(&mut rx).await,
        Some(KernelEvent::AddressAdded(a)) if a.virtual_ip && a.address == vip.address
    ));

    t.kernel.delete_address(&vip).await?;
    assert!(matches!(
        next_event(&mut rx).await,
        Some(KernelEvent::AddressRemoved(a)) if a.address == vip.address
    ));

    Ok(())
}

#[tokio::test]
async fn test_event_stream() -> Result<()> {
    let t = TestKernel::new().await?;
    let mut events = t.kernel.events();

    t.lab.ipsec.expire(&sa_id(0xc000_1001), false);
    t.lab.network.add_interface("eth0", true);

    let first = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .ok()
        .flatten();
    assert_eq!(expect_expire(first).id, sa_id(0xc000_1001));

    let second = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .ok()
        .flatten();
    assert!(matches!(second, Some(KernelEvent::InterfaceUp(_))));

    // the stream ends once the dispatcher is gone
    t.kernel.shutdown().await;
    drop(t);
    let end = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("stream should end after shutdown");
    assert!(end.is_none());

    Ok(())
}

#[tokio::test]
async fn test_hard_expire_frees_spi() -> Result<()> {
    let t = TestKernel::new().await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);
    let (src, dst) = (ip("10.0.0.1"), ip("10.0.0.2"));

    t.lab.ipsec.script_spis([0xc000_0a00]);
    let spi = t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?;

    t.lab.ipsec.expire(&sa_id(spi), true);
    assert!(expect_expire(next_event(&mut rx).await).hard);

    t.lab.ipsec.script_spis([0xc000_0a00]);
    assert_eq!(t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?, spi);

    Ok(())
}

#[tokio::test]
async fn test_queued_events_delivered_on_shutdown() -> Result<()> {
    let t = TestKernel::new().await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);

    // queued, the fan-out task has not run yet
    assert!(t.lab.ipsec.expire(&sa_id(0xc000_1001), true));
    t.kernel.shutdown().await;

    let expire = expect_expire(next_event(&mut rx).await);
    assert!(expire.hard);
    assert_eq!(expire.id.spi, 0xc000_1001);
    assert_quiet(&mut rx).await;

    Ok(())
}

#[tokio::test]
async fn test_no_delivery_after_shutdown() -> Result<()> {
    let t = TestKernel::new().await?;
    let (listener, mut rx) = ChannelListener::new();
    t.kernel.register_listener(listener);

    t.kernel.shutdown().await;
    assert!(!t.lab.ipsec.expire(&sa_id(0xc000_1001), true));
    assert_quiet(&mut rx).await;

    Ok(())
}
