//! Kernel interface dispatcher.
//!
//! [`KernelInterface`] is the single entry point protocol logic uses to
//! install IPsec and routing state. It routes every operation to one of
//! several registered backends, chosen by declared [`Capabilities`] and
//! priority, and fans kernel-origin events out to registered listeners.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kernif::kernel::{Backend, KernelConfig, KernelInterface};
//!
//! let kernel = KernelInterface::new(KernelConfig::default())?;
//! kernel.register_backend(Backend::Ipsec(Arc::new(my_xfrm_backend)), 10).await?;
//!
//! let spi = kernel.get_spi(local, remote, IpsecProtocol::Esp).await?;
//! let id = kernel.install_sa(sa.spi(spi)).await?;
//! ```

pub mod backend;
pub mod capability;
pub mod config;
pub mod dispatcher;
mod error;
pub mod events;
pub mod listener;
mod ownership;
mod registry;
pub mod reqid;
pub mod spi;
pub mod types;

pub use backend::{Backend, BackendId, BackendInfo, BackendKind, IpsecBackend, NetworkBackend};
pub use capability::{Capabilities, Features, Operation};
pub use config::KernelConfig;
pub use dispatcher::KernelInterface;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventSink, EventStream, KernelEvent, Notification};
pub use listener::{KernelListener, ListenerId};
pub use reqid::ReqidKey;
pub use spi::SpiRange;
pub use types::Removal;
