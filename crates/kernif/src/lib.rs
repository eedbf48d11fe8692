//! Kernel interface dispatcher for IPsec control planes.
//!
//! This crate sits between IKE/protocol logic and the operating system. It
//! accepts OS-independent operations (install an SA, install a policy, add a
//! route to a virtual IP, enumerate addresses) and routes each one to the
//! highest-priority registered backend that declares the capability for it.
//! Kernel-originated events (SA expiry, acquires, interface changes) flow the
//! other way: backends push notifications into the dispatcher, which
//! classifies them and fans them out to registered listeners.
//!
//! # Features
//!
//! - `lab` - In-memory kernel implementing both backend contracts (default)
//! - `serde` - Serialize/deserialize [`kernel::KernelConfig`]
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kernif::kernel::{Backend, KernelConfig, KernelInterface};
//! use kernif::kernel::types::{Algorithm, IpsecProtocol, SaDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> kernif::Result<()> {
//!     let kernel = KernelInterface::new(KernelConfig::default())?;
//!     kernel.register_backend(Backend::Ipsec(Arc::new(MyXfrmBackend::new()?)), 10).await?;
//!
//!     let sa = SaDescriptor::new(
//!         "192.0.2.1".parse()?,
//!         "192.0.2.2".parse()?,
//!         IpsecProtocol::Esp,
//!     )
//!     .encryption(Algorithm::new("rfc4106(gcm(aes))", key).icv_bits(128));
//!     let id = kernel.install_sa(sa).await?;
//!     let info = kernel.query_sa(&id).await?;
//!     println!("{} carried {} bytes", id, info.bytes);
//!     Ok(())
//! }
//! ```
//!
//! # Event Monitoring
//!
//! ```ignore
//! use kernif::kernel::events::KernelEvent;
//! use tokio_stream::StreamExt;
//!
//! let mut events = kernel.events();
//! while let Some(event) = events.next().await {
//!     if let KernelEvent::SaExpired(exp) = event {
//!         println!("{} expired (hard: {})", exp.id, exp.hard);
//!     }
//! }
//! ```

pub mod kernel;
pub mod util;

#[cfg(feature = "lab")]
pub mod lab;

// Re-export common types at crate root for convenience
pub use kernel::{Error, ErrorKind, KernelConfig, KernelInterface, Result};
