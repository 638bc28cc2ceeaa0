//! Transport boundary between the client and the server.
//!
//! Exchanges are synchronous request/response over an in-process
//! channel: `send` hands an encoded message to the server side,
//! `recv_next` yields the next queued response, and an absent response
//! is a terminal, non-blocking outcome (`None`), never a wait.

use std::net::Ipv6Addr;

use async_trait::async_trait;
use thiserror::Error;

/// Default destination for client messages (`ff02::1:2`).
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// Relay encapsulation applied to a query before it is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayWrap {
    /// Address of the link the relayed client is attached to.
    pub link_addr: Ipv6Addr,
    /// The client's link-local address as seen by the relay.
    pub peer_addr: Ipv6Addr,
}

/// One encoded client message in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub dest: Ipv6Addr,
    pub relay: Option<RelayWrap>,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("server channel closed")]
    Closed,
}

#[async_trait]
pub trait ServerChannel: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), ChannelError>;

    /// The next response, if the server produced one. `None` models a
    /// silent server or a dropped reply.
    async fn recv_next(&self) -> Option<Vec<u8>>;
}
