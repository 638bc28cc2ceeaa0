//! DHCPv6 lease negotiation engine.
//!
//! A scripted client ([`Dhcp6Client`]) that drives the four-message
//! acquisition flow and the renewal paths against any transport
//! implementing [`ServerChannel`], plus an in-process [`PoolServer`]
//! that answers those exchanges from a fixed pool and persists address
//! bindings through a [`host_store`] backend.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use host_store::HostStoreFactory;
//! use lease6::{Dhcp6Client, PoolServer, ServerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut factory = HostStoreFactory::new();
//! factory.create("type=memory name=hosts").await?;
//!
//! let server = Arc::new(PoolServer::new(
//!     ServerConfig {
//!         subnet_id: 1,
//!         addr_pool: vec!["2001:db8::10".parse()?],
//!         prefix_pool: vec![],
//!         preferred_lft: 1800,
//!         valid_lft: 3600,
//!     },
//!     factory,
//! ));
//!
//! let mut client = Dhcp6Client::new(server);
//! client.use_na(true);
//! client.full_exchange().await?;
//! assert_eq!(client.lease_count(), 1);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod identity;
pub mod lease;
pub mod server;

pub use channel::{ALL_DHCP_RELAY_AGENTS_AND_SERVERS, ChannelError, Envelope, RelayWrap, ServerChannel};
pub use client::{Dhcp6Client, ExchangeContext, ExchangeError};
pub use identity::{ClientIdentity, IdentityGenerator};
pub use lease::{Configuration, IaKind, Lease6, LeaseStatus};
pub use server::{PoolServer, ServerConfig};
