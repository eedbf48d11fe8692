//! SPI and CPI allocation.

use std::collections::HashSet;
use std::time::Duration;

use kernif::kernel::SpiRange;
use kernif::kernel::types::{IpsecProtocol, SaDescriptor, SaId};
use kernif::{Error, ErrorKind, KernelConfig, Result};

use crate::common::{TestKernel, esp_sa, ip};

const A: u32 = 0xc000_0a00;
const B: u32 = 0xc000_0b00;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_are_distinct() -> Result<()> {
    let t = TestKernel::new().await?;
    // every value proposed twice, so concurrent callers collide
    t.lab
        .ipsec
        .script_spis((0..16u32).flat_map(|i| [A + i, A + i]));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let kernel = t.kernel.clone();
        handles.push(tokio::spawn(async move {
            kernel
                .get_spi(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp)
                .await
        }));
    }

    let mut spis = HashSet::new();
    for handle in handles {
        let spi = handle.await.expect("allocation task panicked")?;
        assert!(SpiRange::DEFAULT.contains(spi));
        assert!(spis.insert(spi), "SPI 0x{:08x} handed out twice", spi);
    }
    assert_eq!(spis.len(), 16);

    Ok(())
}

#[tokio::test]
async fn test_reserved_spi_is_skipped() -> Result<()> {
    let t = TestKernel::new().await?;
    let (src, dst) = (ip("10.0.0.1"), ip("10.0.0.2"));

    t.lab.ipsec.script_spis([A, A, B]);
    assert_eq!(t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?, A);
    assert_eq!(t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?, B);

    // reservations are per destination and protocol
    t.lab.ipsec.script_spis([A, A]);
    assert_eq!(t.kernel.get_spi(src, ip("10.0.0.3"), IpsecProtocol::Esp).await?, A);
    assert_eq!(t.kernel.get_spi(src, dst, IpsecProtocol::Ah).await?, A);

    Ok(())
}

#[tokio::test]
async fn test_install_releases_reservation() -> Result<()> {
    let t = TestKernel::new().await?;
    let (src, dst) = (ip("10.0.0.1"), ip("10.0.0.2"));

    t.lab.ipsec.script_spis([A]);
    let spi = t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?;
    let id = t.kernel.install_sa(esp_sa("10.0.0.1", "10.0.0.2").spi(spi)).await?;
    t.kernel.delete_sa(&id).await?;

    // A is free again: neither reserved nor installed
    t.lab.ipsec.script_spis([A]);
    assert_eq!(t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?, A);

    Ok(())
}

#[tokio::test]
async fn test_delete_releases_unused_reservation() -> Result<()> {
    let t = TestKernel::new().await?;
    let (src, dst) = (ip("10.0.0.1"), ip("10.0.0.2"));

    t.lab.ipsec.script_spis([A]);
    let spi = t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?;

    // the SA was never installed, deleting it still frees the SPI
    let id = SaId::new(dst, IpsecProtocol::Esp, spi);
    t.kernel.delete_sa(&id).await?;

    t.lab.ipsec.script_spis([A]);
    assert_eq!(t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?, A);

    Ok(())
}

#[tokio::test]
async fn test_reservation_times_out() -> Result<()> {
    let t = TestKernel::with_config(
        KernelConfig::new().spi_reservation_timeout(Duration::from_millis(50)),
    )
    .await?;
    let (src, dst) = (ip("10.0.0.1"), ip("10.0.0.2"));

    t.lab.ipsec.script_spis([A]);
    t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    t.lab.ipsec.script_spis([A]);
    assert_eq!(t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?, A);

    Ok(())
}

#[tokio::test]
async fn test_exhaustion_after_attempts() -> Result<()> {
    let t = TestKernel::with_config(KernelConfig::new().spi_alloc_attempts(3)).await?;
    let (src, dst) = (ip("10.0.0.1"), ip("10.0.0.2"));

    t.lab.ipsec.script_spis([A, A, A, A]);
    t.kernel.get_spi(src, dst, IpsecProtocol::Esp).await?;

    let err = t
        .kernel
        .get_spi(src, dst, IpsecProtocol::Esp)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert!(err.to_string().contains("after 3 attempts"));
    assert_eq!(t.lab.ipsec.calls("alloc_spi"), 4);

    Ok(())
}

#[tokio::test]
async fn test_out_of_range_proposals_discarded() -> Result<()> {
    let t = TestKernel::with_config(KernelConfig::new().spi_range(0x1000, 0x1fff)).await?;

    t.lab.ipsec.script_spis([0x50, 0x2000, 0x1234]);
    let spi = t
        .kernel
        .get_spi(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp)
        .await?;
    assert_eq!(spi, 0x1234);

    Ok(())
}

#[tokio::test]
async fn test_cpi_in_range() -> Result<()> {
    let t = TestKernel::new().await?;

    let cpi = t.kernel.get_cpi(ip("10.0.0.1"), ip("10.0.0.2")).await?;
    assert!(SpiRange::CPI.contains(u32::from(cpi)));

    let other = t.kernel.get_cpi(ip("10.0.0.1"), ip("10.0.0.2")).await?;
    assert_ne!(cpi, other);

    Ok(())
}

#[tokio::test]
async fn test_install_allocates_missing_spi() -> Result<()> {
    let t = TestKernel::new().await?;

    let id = t.kernel.install_sa(esp_sa("10.0.0.1", "10.0.0.2")).await?;
    assert!(SpiRange::DEFAULT.contains(id.spi));
    assert!(t.lab.ipsec.has_sa(&id));
    assert_eq!(t.lab.ipsec.sa(&id).and_then(|sa| sa.spi), Some(id.spi));

    let comp = SaDescriptor::new(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Comp)
        .compression("deflate");
    let id = t.kernel.install_sa(comp).await?;
    assert!(SpiRange::CPI.contains(id.spi));

    Ok(())
}

#[tokio::test]
async fn test_backend_failure_during_allocation() -> Result<()> {
    let t = TestKernel::new().await?;
    t.lab.ipsec.fail_next(Error::from_errno(-libc::ENOMEM));

    let err = t
        .kernel
        .get_spi(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOMEM));

    // nothing was left reserved or locked
    t.kernel
        .get_spi(ip("10.0.0.1"), ip("10.0.0.2"), IpsecProtocol::Esp)
        .await?;
    Ok(())
}
