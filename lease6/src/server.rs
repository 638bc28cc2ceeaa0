//! In-process DHCPv6 server with a fixed address/prefix pool.
//!
//! Implements [`ServerChannel`] so a [`crate::Dhcp6Client`] can run
//! complete exchanges against it without a network. Address bindings
//! are persisted through a [`HostStoreFactory`] backend and committed
//! per exchange; delegated prefixes are tracked in process memory.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, offset::Utc};
use dhcproto::{Decodable, Decoder, Encodable, v6};
use host_store::{
    HostIdentifier, HostRecord, HostStore, HostStoreFactory, LeaseKind, StoreError,
    expiry_from_cltt, systime_epoch, to_systime,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, Envelope, ServerChannel};
use crate::lease::{
    STATUS_NO_ADDRS_AVAIL, STATUS_NO_BINDING, STATUS_NO_PREFIX_AVAIL, STATUS_UNSPEC_FAIL,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub subnet_id: u32,
    /// Addresses handed out to IA_NA requests, in order.
    pub addr_pool: Vec<Ipv6Addr>,
    /// `(prefix, length)` pairs handed out to IA_PD requests, in order.
    pub prefix_pool: Vec<(Ipv6Addr, u8)>,
    pub preferred_lft: u32,
    pub valid_lft: u32,
}

pub struct PoolServer {
    inner: Mutex<Inner>,
}

struct Inner {
    config: ServerConfig,
    factory: HostStoreFactory,
    server_id: Vec<u8>,
    outbox: VecDeque<Vec<u8>>,
    responsive: bool,
    tamper_xid: bool,
    next_addr: usize,
    next_prefix: usize,
    /// Delegated prefixes by client DUID. Prefix delegations are not
    /// host reservations, so they live outside the host store.
    pd_bindings: HashMap<Vec<u8>, (Ipv6Addr, u8)>,
}

impl PoolServer {
    /// The factory must already hold a created backend; every bind goes
    /// through [`HostStoreFactory::instance`].
    pub fn new(config: ServerConfig, factory: HostStoreFactory) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                factory,
                // DUID-EN shaped, stable for the server's lifetime
                server_id: vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04],
                outbox: VecDeque::new(),
                responsive: true,
                tamper_xid: false,
                next_addr: 0,
                next_prefix: 0,
                pd_bindings: HashMap::new(),
            }),
        }
    }

    /// A silenced server drops every query without replying.
    pub async fn set_responsive(&self, responsive: bool) {
        self.inner.lock().await.responsive = responsive;
    }

    /// When set, replies go out with a corrupted transaction id.
    pub async fn set_tamper_xid(&self, tamper: bool) {
        self.inner.lock().await.tamper_xid = tamper;
    }

    /// Direct access to the persistence backend, for inspection.
    pub async fn store(&self) -> Result<Arc<dyn HostStore>, StoreError> {
        self.inner.lock().await.factory.instance()
    }
}

#[async_trait]
impl ServerChannel for PoolServer {
    async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.inner.lock().await.handle(envelope).await;
        Ok(())
    }

    async fn recv_next(&self) -> Option<Vec<u8>> {
        self.inner.lock().await.outbox.pop_front()
    }
}

impl Inner {
    async fn handle(&mut self, envelope: Envelope) {
        if !self.responsive {
            debug!("server silenced, dropping query");
            return;
        }
        if let Some(relay) = &envelope.relay {
            debug!(link_addr = %relay.link_addr, peer_addr = %relay.peer_addr, "query arrived through a relay");
        }
        let msg = match v6::Message::decode(&mut Decoder::new(&envelope.payload)) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "ignoring undecodable query");
                return;
            }
        };
        let Some(duid) = client_duid(&msg) else {
            warn!(msg_type = ?msg.msg_type(), "ignoring query without a client id");
            return;
        };

        let mut xid = msg.xid();
        if self.tamper_xid {
            xid[2] ^= 0xff;
        }

        let reply = match msg.msg_type() {
            v6::MessageType::Solicit => Some(self.advertise(&msg, &duid, xid).await),
            v6::MessageType::Request => Some(self.bind(&msg, &duid, xid).await),
            v6::MessageType::Renew | v6::MessageType::Rebind => {
                Some(self.extend(&msg, &duid, xid).await)
            }
            other => {
                debug!(msg_type = ?other, "unsupported message type");
                None
            }
        };
        if let Some(reply) = reply {
            match reply.to_vec() {
                Ok(payload) => self.outbox.push_back(payload),
                Err(err) => error!(%err, "failed to encode reply"),
            }
        }
    }

    /// Advertise offers without consuming the pool or touching the
    /// store; allocation happens at Request time.
    async fn advertise(&mut self, msg: &v6::Message, duid: &[u8], xid: [u8; 3]) -> v6::Message {
        let mut reply = self.base_reply(v6::MessageType::Advertise, xid, duid);
        if let Some(v6::DhcpOption::IANA(iana)) = msg.opts().get(v6::OptionCode::IANA) {
            let offered = match self.existing_addr(duid).await {
                Ok(existing) => existing.or_else(|| self.config.addr_pool.get(self.next_addr).copied()),
                Err(err) => {
                    error!(%err, "host store lookup failed during advertise");
                    None
                }
            };
            let opt = match offered {
                Some(addr) => self.ia_na_response(iana.id, addr),
                None => ia_na_error(iana.id, STATUS_NO_ADDRS_AVAIL, "no addresses left"),
            };
            reply.opts_mut().insert(opt);
        }
        if let Some(v6::DhcpOption::IAPD(iapd)) = msg.opts().get(v6::OptionCode::IAPD) {
            let offered = self
                .pd_bindings
                .get(duid)
                .copied()
                .or_else(|| self.config.prefix_pool.get(self.next_prefix).copied());
            let opt = match offered {
                Some((prefix, len)) => self.ia_pd_response(iapd.id, prefix, len),
                None => ia_pd_error(iapd.id, STATUS_NO_PREFIX_AVAIL, "no prefixes left"),
            };
            reply.opts_mut().insert(opt);
        }
        reply
    }

    /// Request: allocate (or re-confirm) and persist the bindings.
    async fn bind(&mut self, msg: &v6::Message, duid: &[u8], xid: [u8; 3]) -> v6::Message {
        let mut reply = self.base_reply(v6::MessageType::Reply, xid, duid);
        if let Some(v6::DhcpOption::IANA(iana)) = msg.opts().get(v6::OptionCode::IANA) {
            let opt = match self.bind_addr(duid, iana.id).await {
                Ok(opt) => opt,
                Err(err) => {
                    error!(%err, iaid = iana.id, "address bind failed");
                    ia_na_error(iana.id, STATUS_UNSPEC_FAIL, "binding failed")
                }
            };
            reply.opts_mut().insert(opt);
        }
        if let Some(v6::DhcpOption::IAPD(iapd)) = msg.opts().get(v6::OptionCode::IAPD) {
            let opt = self.bind_prefix(duid, iapd.id);
            reply.opts_mut().insert(opt);
        }
        reply
    }

    /// Renew/Rebind: extend known bindings, answer NoBinding for
    /// clients we have never bound.
    async fn extend(&mut self, msg: &v6::Message, duid: &[u8], xid: [u8; 3]) -> v6::Message {
        let mut reply = self.base_reply(v6::MessageType::Reply, xid, duid);
        if let Some(v6::DhcpOption::IANA(iana)) = msg.opts().get(v6::OptionCode::IANA) {
            let opt = match self.extend_addr(duid, iana.id).await {
                Ok(opt) => opt,
                Err(err) => {
                    error!(%err, iaid = iana.id, "address extension failed");
                    ia_na_error(iana.id, STATUS_UNSPEC_FAIL, "extension failed")
                }
            };
            reply.opts_mut().insert(opt);
        }
        if let Some(v6::DhcpOption::IAPD(iapd)) = msg.opts().get(v6::OptionCode::IAPD) {
            let opt = match self.pd_bindings.get(duid).copied() {
                Some((prefix, len)) => self.ia_pd_response(iapd.id, prefix, len),
                None => ia_pd_error(iapd.id, STATUS_NO_BINDING, "no prefix bound for this client"),
            };
            reply.opts_mut().insert(opt);
        }
        reply
    }

    async fn bind_addr(&mut self, duid: &[u8], iaid: u32) -> Result<v6::DhcpOption, StoreError> {
        let addr = match self.existing_addr(duid).await? {
            Some(addr) => addr,
            None => match self.config.addr_pool.get(self.next_addr).copied() {
                Some(addr) => {
                    self.next_addr += 1;
                    addr
                }
                None => return Ok(ia_na_error(iaid, STATUS_NO_ADDRS_AVAIL, "no addresses left")),
            },
        };
        self.persist_addr(duid, addr).await?;
        Ok(self.ia_na_response(iaid, addr))
    }

    async fn extend_addr(&mut self, duid: &[u8], iaid: u32) -> Result<v6::DhcpOption, StoreError> {
        let Some(addr) = self.existing_addr(duid).await? else {
            return Ok(ia_na_error(
                iaid,
                STATUS_NO_BINDING,
                "no address bound for this client",
            ));
        };
        self.persist_addr(duid, addr).await?;
        Ok(self.ia_na_response(iaid, addr))
    }

    async fn existing_addr(&self, duid: &[u8]) -> Result<Option<Ipv6Addr>, StoreError> {
        let store = self.factory.instance()?;
        let record = store.get_host(&HostIdentifier::Duid(duid.to_vec())).await?;
        Ok(record.map(|record| record.addr))
    }

    /// Replace-then-insert inside the backend's transaction, committed
    /// before the Reply is queued.
    async fn persist_addr(&self, duid: &[u8], addr: Ipv6Addr) -> Result<(), StoreError> {
        let store = self.factory.instance()?;
        let identifier = HostIdentifier::Duid(duid.to_vec());
        store.delete_host(&identifier).await?;

        let cltt = systime_epoch(SystemTime::now());
        let expires_at = to_systime(expiry_from_cltt(cltt, self.config.valid_lft));
        info!(
            %addr,
            subnet_id = self.config.subnet_id,
            expires_at = %DateTime::<Utc>::from(expires_at).to_rfc3339_opts(SecondsFormat::Secs, true),
            "binding address lease"
        );
        store
            .add_host(HostRecord {
                identifier,
                subnet_id: self.config.subnet_id,
                kind: LeaseKind::Address,
                addr,
                prefix_len: 0,
                preferred_lifetime: self.config.preferred_lft,
                valid_lifetime: self.config.valid_lft,
                expires_at,
            })
            .await?;
        store.commit().await
    }

    fn bind_prefix(&mut self, duid: &[u8], iaid: u32) -> v6::DhcpOption {
        let existing = self.pd_bindings.get(duid).copied();
        let delegated = existing.or_else(|| {
            let taken = self.config.prefix_pool.get(self.next_prefix).copied();
            if taken.is_some() {
                self.next_prefix += 1;
            }
            taken
        });
        match delegated {
            Some((prefix, len)) => {
                self.pd_bindings.insert(duid.to_vec(), (prefix, len));
                self.ia_pd_response(iaid, prefix, len)
            }
            None => ia_pd_error(iaid, STATUS_NO_PREFIX_AVAIL, "no prefixes left"),
        }
    }

    fn base_reply(&self, msg_type: v6::MessageType, xid: [u8; 3], duid: &[u8]) -> v6::Message {
        let mut reply = v6::Message::new_with_id(msg_type, xid);
        reply
            .opts_mut()
            .insert(v6::DhcpOption::ServerId(self.server_id.clone()));
        reply
            .opts_mut()
            .insert(v6::DhcpOption::ClientId(duid.to_vec()));
        reply
    }

    fn ia_na_response(&self, iaid: u32, addr: Ipv6Addr) -> v6::DhcpOption {
        let valid = self.config.valid_lft;
        let mut iana = v6::IANA {
            id: iaid,
            t1: valid / 2,
            t2: (u64::from(valid) * 4 / 5) as u32,
            opts: v6::DhcpOptions::new(),
        };
        iana.opts.insert(v6::DhcpOption::IAAddr(v6::IAAddr {
            addr,
            preferred_life: self.config.preferred_lft,
            valid_life: valid,
            opts: v6::DhcpOptions::new(),
        }));
        v6::DhcpOption::IANA(iana)
    }

    fn ia_pd_response(&self, iaid: u32, prefix: Ipv6Addr, len: u8) -> v6::DhcpOption {
        let valid = self.config.valid_lft;
        let mut iapd = v6::IAPD {
            id: iaid,
            t1: valid / 2,
            t2: (u64::from(valid) * 4 / 5) as u32,
            opts: v6::DhcpOptions::new(),
        };
        iapd.opts.insert(v6::DhcpOption::IAPrefix(v6::IAPrefix {
            prefix_ip: prefix,
            prefix_len: len,
            preferred_lifetime: self.config.preferred_lft,
            valid_lifetime: valid,
            opts: v6::DhcpOptions::new(),
        }));
        v6::DhcpOption::IAPD(iapd)
    }
}

fn ia_na_error(iaid: u32, status: u16, message: &str) -> v6::DhcpOption {
    let mut iana = v6::IANA {
        id: iaid,
        t1: 0,
        t2: 0,
        opts: v6::DhcpOptions::new(),
    };
    iana.opts.insert(v6::DhcpOption::StatusCode(v6::StatusCode {
        status: v6::Status::from(status),
        msg: message.into(),
    }));
    v6::DhcpOption::IANA(iana)
}

fn ia_pd_error(iaid: u32, status: u16, message: &str) -> v6::DhcpOption {
    let mut iapd = v6::IAPD {
        id: iaid,
        t1: 0,
        t2: 0,
        opts: v6::DhcpOptions::new(),
    };
    iapd.opts.insert(v6::DhcpOption::StatusCode(v6::StatusCode {
        status: v6::Status::from(status),
        msg: message.into(),
    }));
    v6::DhcpOption::IAPD(iapd)
}

fn client_duid(msg: &v6::Message) -> Option<Vec<u8>> {
    if let Some(v6::DhcpOption::ClientId(duid)) = msg.opts().get(v6::OptionCode::ClientId) {
        Some(duid.clone())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;
    use std::sync::Arc;

    use dhcproto::{Decodable, Decoder, Encodable, v6};
    use host_store::{HostIdentifier, HostStoreFactory};

    use super::{PoolServer, ServerConfig};
    use crate::channel::{Envelope, ServerChannel};
    use crate::lease::{STATUS_NO_ADDRS_AVAIL, STATUS_NO_BINDING};

    fn config(pool_size: u16) -> ServerConfig {
        ServerConfig {
            subnet_id: 1,
            addr_pool: (1..=pool_size)
                .map(|i| Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i))
                .collect(),
            prefix_pool: vec![(Ipv6Addr::new(0x2001, 0xdb8, 0xff, 0, 0, 0, 0, 0), 56)],
            preferred_lft: 1800,
            valid_lft: 3600,
        }
    }

    async fn server(pool_size: u16) -> PoolServer {
        let mut factory = HostStoreFactory::new();
        factory
            .create("type=memory name=keatest")
            .await
            .expect("backend");
        PoolServer::new(config(pool_size), factory)
    }

    fn query(msg_type: v6::MessageType, duid: &[u8], iaid: u32) -> Envelope {
        let mut msg = v6::Message::new_with_id(msg_type, [0, 0, 1]);
        msg.opts_mut()
            .insert(v6::DhcpOption::ClientId(duid.to_vec()));
        msg.opts_mut().insert(v6::DhcpOption::IANA(v6::IANA {
            id: iaid,
            t1: 0,
            t2: 0,
            opts: v6::DhcpOptions::new(),
        }));
        Envelope {
            payload: msg.to_vec().expect("encodable query"),
            dest: crate::channel::ALL_DHCP_RELAY_AGENTS_AND_SERVERS,
            relay: None,
        }
    }

    async fn reply_of(server: &PoolServer) -> v6::Message {
        let payload = server.recv_next().await.expect("queued reply");
        v6::Message::decode(&mut Decoder::new(&payload)).expect("decodable reply")
    }

    fn ia_na_of(reply: &v6::Message) -> &v6::IANA {
        match reply.opts().get(v6::OptionCode::IANA) {
            Some(v6::DhcpOption::IANA(iana)) => iana,
            _ => panic!("reply is missing its IA_NA"),
        }
    }

    #[tokio::test]
    async fn request_binds_and_persists() {
        let server = server(4).await;
        server
            .send(query(v6::MessageType::Request, &[0xaa], 1))
            .await
            .expect("send");

        let reply = reply_of(&server).await;
        assert_eq!(reply.msg_type(), v6::MessageType::Reply);
        let iana = ia_na_of(&reply);
        assert_eq!(iana.t1, 1800);
        assert_eq!(iana.t2, 2880);

        let record = server
            .store()
            .await
            .expect("store")
            .get_host(&HostIdentifier::Duid(vec![0xaa]))
            .await
            .expect("get")
            .expect("persisted binding");
        assert_eq!(record.valid_lifetime, 3600);
    }

    #[tokio::test]
    async fn exhausted_pool_reports_no_addrs_avail() {
        let server = server(1).await;
        server
            .send(query(v6::MessageType::Request, &[0xaa], 1))
            .await
            .expect("send");
        let _ = reply_of(&server).await;

        server
            .send(query(v6::MessageType::Request, &[0xbb], 2))
            .await
            .expect("send");
        let reply = reply_of(&server).await;
        let iana = ia_na_of(&reply);
        match iana.opts.get(v6::OptionCode::StatusCode) {
            Some(v6::DhcpOption::StatusCode(code)) => {
                assert_eq!(u16::from(code.status), STATUS_NO_ADDRS_AVAIL);
            }
            _ => panic!("expected a status code"),
        }
    }

    #[tokio::test]
    async fn renew_from_unknown_client_reports_no_binding() {
        let server = server(4).await;
        server
            .send(query(v6::MessageType::Renew, &[0xcc], 1))
            .await
            .expect("send");

        let reply = reply_of(&server).await;
        let iana = ia_na_of(&reply);
        match iana.opts.get(v6::OptionCode::StatusCode) {
            Some(v6::DhcpOption::StatusCode(code)) => {
                assert_eq!(u16::from(code.status), STATUS_NO_BINDING);
            }
            _ => panic!("expected a status code"),
        }
    }

    #[tokio::test]
    async fn silenced_server_queues_nothing() {
        let server = server(4).await;
        server.set_responsive(false).await;
        server
            .send(query(v6::MessageType::Request, &[0xdd], 1))
            .await
            .expect("send");
        assert!(server.recv_next().await.is_none());
    }
}
