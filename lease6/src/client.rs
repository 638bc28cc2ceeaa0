//! DHCPv6 client exchange engine.
//!
//! Drives the four-message acquisition flow (Solicit/Advertise then
//! Request/Reply) and the renewal paths (Renew, Rebind) against any
//! [`ServerChannel`]. Wire faults never abort an exchange: a silent
//! server, an undecodable response, or a transaction-id mismatch all
//! leave the held [`Configuration`] untouched and the exchange returns
//! `Ok` with no response in context.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::SystemTime;

use dhcproto::{Decodable, Decoder, Encodable, v6};
use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::{
    ALL_DHCP_RELAY_AGENTS_AND_SERVERS, ChannelError, Envelope, RelayWrap, ServerChannel,
};
use crate::identity::{ClientIdentity, IdentityGenerator};
use crate::lease::{Configuration, IaKind, Lease6, STATUS_SUCCESS};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The last query sent and the last response accepted for it.
#[derive(Debug, Default, Clone)]
pub struct ExchangeContext {
    pub query: Option<v6::Message>,
    pub response: Option<v6::Message>,
}

/// A scripted DHCPv6 client bound to one server channel.
#[derive(Debug)]
pub struct Dhcp6Client<C> {
    channel: Arc<C>,
    identity: ClientIdentity,
    curr_xid: u32,
    dest: Ipv6Addr,
    link_local: Ipv6Addr,
    /// Link address stamped on relayed queries.
    pub relay_link_addr: Ipv6Addr,
    use_na: bool,
    use_pd: bool,
    use_relay: bool,
    /// Leases acquired so far.
    pub config: Configuration,
    context: ExchangeContext,
}

impl<C: ServerChannel> Dhcp6Client<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self::with_identity(channel, IdentityGenerator::new(0).identity(0))
    }

    pub fn with_identity(channel: Arc<C>, identity: ClientIdentity) -> Self {
        Self {
            channel,
            identity,
            curr_xid: 0,
            dest: ALL_DHCP_RELAY_AGENTS_AND_SERVERS,
            link_local: Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1),
            relay_link_addr: Ipv6Addr::new(0x3000, 1, 1, 0, 0, 0, 0, 1),
            use_na: false,
            use_pd: false,
            use_relay: false,
            config: Configuration::default(),
            context: ExchangeContext::default(),
        }
    }

    /// Request an IA_NA in subsequent Solicits.
    pub fn use_na(&mut self, enabled: bool) {
        self.use_na = enabled;
    }

    /// Request an IA_PD in subsequent Solicits.
    pub fn use_pd(&mut self, enabled: bool) {
        self.use_pd = enabled;
    }

    /// Wrap outgoing queries in a relay envelope.
    pub fn use_relay(&mut self, enabled: bool) {
        self.use_relay = enabled;
    }

    pub fn set_dest(&mut self, dest: Ipv6Addr) {
        self.dest = dest;
    }

    pub fn client_id(&self) -> &[u8] {
        &self.identity.duid
    }

    /// Perturbs the DUID so the next exchange presents a different
    /// identity to the server.
    pub fn modify_duid(&mut self) {
        self.identity.bump_duid();
    }

    pub fn context(&self) -> &ExchangeContext {
        &self.context
    }

    pub fn lease(&self, at: usize) -> Option<&Lease6> {
        self.config.lease(at)
    }

    pub fn status(&self, at: usize) -> Option<u16> {
        self.config.status(at)
    }

    pub fn lease_count(&self) -> usize {
        self.config.len()
    }

    /// Simulates elapsed time by rewinding every held lease's cltt.
    pub fn advance_clock(&mut self, secs: u64) {
        self.config.rewind_cltt(secs);
    }

    /// Full four-message acquisition. If no Advertise arrives the
    /// Request leg is skipped and the configuration stays empty.
    pub async fn full_exchange(&mut self) -> Result<(), ExchangeError> {
        self.solicit_advertise().await?;
        if self.context.response.is_none() {
            debug!("no advertise received, skipping request");
            return Ok(());
        }
        self.request_reply().await
    }

    /// Sends a Solicit carrying the configured IA options and stores
    /// the Advertise, if any. An Advertise is an offer only; it never
    /// mutates the configuration.
    pub async fn solicit_advertise(&mut self) -> Result<(), ExchangeError> {
        let mut msg = self.next_msg(v6::MessageType::Solicit);
        if self.use_na {
            msg.opts_mut().insert(v6::DhcpOption::IANA(v6::IANA {
                id: self.identity.iaid,
                t1: 0,
                t2: 0,
                opts: v6::DhcpOptions::new(),
            }));
        }
        if self.use_pd {
            msg.opts_mut().insert(v6::DhcpOption::IAPD(v6::IAPD {
                id: self.identity.pd_iaid,
                t1: 0,
                t2: 0,
                opts: v6::DhcpOptions::new(),
            }));
        }
        self.send_msg(msg).await?;
        self.recv_response().await?;
        Ok(())
    }

    /// Sends a Request echoing the IAs from the stored Advertise and
    /// folds the Reply into the configuration.
    pub async fn request_reply(&mut self) -> Result<(), ExchangeError> {
        let Some(advertise) = self.context.response.clone() else {
            debug!("no advertise in context, nothing to request");
            return Ok(());
        };
        if advertise.msg_type() != v6::MessageType::Advertise {
            warn!(msg_type = ?advertise.msg_type(), "stored response is not an advertise");
            return Ok(());
        }

        let mut msg = self.next_msg(v6::MessageType::Request);
        if let Some(server_id) = extract_server_id(&advertise) {
            msg.opts_mut().insert(v6::DhcpOption::ServerId(server_id));
        }
        copy_ias(&advertise, &mut msg);
        self.send_apply(msg).await
    }

    /// Unicast-style renewal toward the server that bound our leases.
    pub async fn renew(&mut self) -> Result<(), ExchangeError> {
        let server_id = self.context.response.as_ref().and_then(extract_server_id);
        let mut msg = self.next_msg(v6::MessageType::Renew);
        if let Some(server_id) = server_id {
            msg.opts_mut().insert(v6::DhcpOption::ServerId(server_id));
        }
        self.insert_held_ias(&mut msg);
        self.send_apply(msg).await
    }

    /// Rebind carries no ServerId: it asks any server on the link to
    /// take over the bindings.
    pub async fn rebind(&mut self) -> Result<(), ExchangeError> {
        let mut msg = self.next_msg(v6::MessageType::Rebind);
        self.insert_held_ias(&mut msg);
        self.send_apply(msg).await
    }

    async fn send_apply(&mut self, msg: v6::Message) -> Result<(), ExchangeError> {
        self.send_msg(msg).await?;
        if let Some(reply) = self.recv_response().await?
            && reply.msg_type() == v6::MessageType::Reply
        {
            self.apply_reply(&reply);
        }
        Ok(())
    }

    /// Fresh message with the next transaction id and the standard
    /// client options.
    fn next_msg(&mut self, msg_type: v6::MessageType) -> v6::Message {
        self.curr_xid = self.curr_xid.wrapping_add(1);
        let mut msg = v6::Message::new_with_id(msg_type, xid_bytes(self.curr_xid));
        msg.opts_mut()
            .insert(v6::DhcpOption::ClientId(self.identity.duid.clone()));
        msg.opts_mut().insert(v6::DhcpOption::ElapsedTime(0));
        msg
    }

    async fn send_msg(&mut self, msg: v6::Message) -> Result<(), ExchangeError> {
        let payload = msg
            .to_vec()
            .map_err(|err| ExchangeError::Encode(err.to_string()))?;
        let relay = self.use_relay.then(|| RelayWrap {
            link_addr: self.relay_link_addr,
            peer_addr: self.link_local,
        });
        debug!(msg_type = ?msg.msg_type(), xid = ?msg.xid(), relayed = relay.is_some(), "sending query");
        self.context.query = Some(msg);
        self.context.response = None;
        self.channel
            .send(Envelope {
                payload,
                dest: self.dest,
                relay,
            })
            .await?;
        Ok(())
    }

    /// Pulls the next response and screens it: undecodable payloads and
    /// transaction-id mismatches are dropped as if nothing arrived.
    async fn recv_response(&mut self) -> Result<Option<v6::Message>, ExchangeError> {
        let Some(payload) = self.channel.recv_next().await else {
            debug!("no response from server");
            return Ok(None);
        };
        let msg = match v6::Message::decode(&mut Decoder::new(&payload)) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "dropping undecodable response");
                return Ok(None);
            }
        };
        if let Some(query) = &self.context.query
            && msg.xid() != query.xid()
        {
            warn!(got = ?msg.xid(), want = ?query.xid(), "dropping response with mismatched transaction id");
            return Ok(None);
        }
        self.context.response = Some(msg.clone());
        Ok(Some(msg))
    }

    /// Folds a Reply into the configuration, one IA at a time. IAs the
    /// Reply does not mention keep their previous state.
    fn apply_reply(&mut self, reply: &v6::Message) {
        if let Some(v6::DhcpOption::IANA(iana)) = reply.opts().get(v6::OptionCode::IANA) {
            self.apply_ia_na(iana);
        }
        if let Some(v6::DhcpOption::IAPD(iapd)) = reply.opts().get(v6::OptionCode::IAPD) {
            self.apply_ia_pd(iapd);
        }
    }

    fn apply_ia_na(&mut self, iana: &v6::IANA) {
        let status = ia_status(&iana.opts);
        if status != STATUS_SUCCESS {
            debug!(iaid = iana.id, status, "server reported failure for IA_NA");
            self.config.mark_status(iana.id, IaKind::Na, status);
            return;
        }
        let Some(v6::DhcpOption::IAAddr(ia_addr)) = iana.opts.get(v6::OptionCode::IAAddr) else {
            debug!(iaid = iana.id, "IA_NA without a bound address ignored");
            return;
        };
        self.config.apply(
            Lease6 {
                addr: ia_addr.addr,
                prefix_len: 0,
                kind: IaKind::Na,
                iaid: iana.id,
                preferred_lft: ia_addr.preferred_life,
                valid_lft: ia_addr.valid_life,
                // an accepted bind always restarts the lease clock
                cltt: SystemTime::now(),
            },
            status,
        );
    }

    fn apply_ia_pd(&mut self, iapd: &v6::IAPD) {
        let status = ia_status(&iapd.opts);
        if status != STATUS_SUCCESS {
            debug!(iaid = iapd.id, status, "server reported failure for IA_PD");
            self.config.mark_status(iapd.id, IaKind::Pd, status);
            return;
        }
        let Some(v6::DhcpOption::IAPrefix(ia_prefix)) = iapd.opts.get(v6::OptionCode::IAPrefix)
        else {
            debug!(iaid = iapd.id, "IA_PD without a delegated prefix ignored");
            return;
        };
        self.config.apply(
            Lease6 {
                addr: ia_prefix.prefix_ip,
                prefix_len: ia_prefix.prefix_len,
                kind: IaKind::Pd,
                iaid: iapd.id,
                preferred_lft: ia_prefix.preferred_lifetime,
                valid_lft: ia_prefix.valid_lifetime,
                cltt: SystemTime::now(),
            },
            status,
        );
    }

    /// Re-encodes the held leases as IA options for Renew/Rebind.
    fn insert_held_ias(&self, msg: &mut v6::Message) {
        for lease in self.config.leases() {
            match lease.kind {
                IaKind::Na => {
                    let mut iana = v6::IANA {
                        id: lease.iaid,
                        t1: 0,
                        t2: 0,
                        opts: v6::DhcpOptions::new(),
                    };
                    iana.opts.insert(v6::DhcpOption::IAAddr(v6::IAAddr {
                        addr: lease.addr,
                        preferred_life: lease.preferred_lft,
                        valid_life: lease.valid_lft,
                        opts: v6::DhcpOptions::new(),
                    }));
                    msg.opts_mut().insert(v6::DhcpOption::IANA(iana));
                }
                IaKind::Pd => {
                    let mut iapd = v6::IAPD {
                        id: lease.iaid,
                        t1: 0,
                        t2: 0,
                        opts: v6::DhcpOptions::new(),
                    };
                    iapd.opts.insert(v6::DhcpOption::IAPrefix(v6::IAPrefix {
                        prefix_ip: lease.addr,
                        prefix_len: lease.prefix_len,
                        preferred_lifetime: lease.preferred_lft,
                        valid_lifetime: lease.valid_lft,
                        opts: v6::DhcpOptions::new(),
                    }));
                    msg.opts_mut().insert(v6::DhcpOption::IAPD(iapd));
                }
            }
        }
    }
}

fn xid_bytes(xid: u32) -> [u8; 3] {
    [
        ((xid >> 16) & 0xff) as u8,
        ((xid >> 8) & 0xff) as u8,
        (xid & 0xff) as u8,
    ]
}

fn ia_status(opts: &v6::DhcpOptions) -> u16 {
    if let Some(v6::DhcpOption::StatusCode(code)) = opts.get(v6::OptionCode::StatusCode) {
        u16::from(code.status)
    } else {
        // absence of a StatusCode option means success
        STATUS_SUCCESS
    }
}

fn extract_server_id(msg: &v6::Message) -> Option<Vec<u8>> {
    if let Some(v6::DhcpOption::ServerId(id)) = msg.opts().get(v6::OptionCode::ServerId) {
        Some(id.clone())
    } else {
        None
    }
}

fn copy_ias(source: &v6::Message, dest: &mut v6::Message) {
    for code in [v6::OptionCode::IANA, v6::OptionCode::IAPD] {
        if let Some(opt) = source.opts().get(code) {
            dest.opts_mut().insert(opt.clone());
        }
    }
}
