//! Client-side view of negotiated leases.
//!
//! The configuration is only ever mutated by folding in a server Reply;
//! it is never partially updated. Status codes are kept as raw wire
//! values (the same `u16` the StatusCode option carries) so the model
//! stays independent of the codec.

use std::net::Ipv6Addr;
use std::time::{Duration, SystemTime};

pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_UNSPEC_FAIL: u16 = 1;
pub const STATUS_NO_ADDRS_AVAIL: u16 = 2;
pub const STATUS_NO_BINDING: u16 = 3;
pub const STATUS_NOT_ON_LINK: u16 = 4;
pub const STATUS_NO_PREFIX_AVAIL: u16 = 6;

/// Which identity-association flavor a lease belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IaKind {
    /// IA_NA, a non-temporary address.
    Na,
    /// IA_PD, a delegated prefix.
    Pd,
}

/// One acquired address or delegated prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease6 {
    pub addr: Ipv6Addr,
    /// 0 for plain addresses.
    pub prefix_len: u8,
    pub kind: IaKind,
    pub iaid: u32,
    pub preferred_lft: u32,
    pub valid_lft: u32,
    /// Client last transaction time. Every accepted bind stamps this
    /// fresh; remaining lifetime is measured from here.
    pub cltt: SystemTime,
}

/// A lease together with the last status code the server sent for its
/// IA. A failure status can arrive before any lease was bound, in
/// which case `lease` stays empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub iaid: u32,
    pub kind: IaKind,
    pub lease: Option<Lease6>,
    pub status: u16,
}

/// Ordered collection of [`LeaseStatus`] entries, keyed by
/// `(iaid, kind)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    entries: Vec<LeaseStatus>,
}

impl Configuration {
    /// Inserts or replaces the lease for its `(iaid, kind)` key.
    pub fn apply(&mut self, lease: Lease6, status: u16) {
        match self.entry_mut(lease.iaid, lease.kind) {
            Some(entry) => {
                entry.lease = Some(lease);
                entry.status = status;
            }
            None => self.entries.push(LeaseStatus {
                iaid: lease.iaid,
                kind: lease.kind,
                lease: Some(lease),
                status,
            }),
        }
    }

    /// Records a status code for an IA without touching its lease.
    pub fn mark_status(&mut self, iaid: u32, kind: IaKind, status: u16) {
        match self.entry_mut(iaid, kind) {
            Some(entry) => entry.status = status,
            None => self.entries.push(LeaseStatus {
                iaid,
                kind,
                lease: None,
                status,
            }),
        }
    }

    pub fn get(&self, at: usize) -> Option<&LeaseStatus> {
        self.entries.get(at)
    }

    pub fn lease(&self, at: usize) -> Option<&Lease6> {
        self.entries.get(at).and_then(|entry| entry.lease.as_ref())
    }

    pub fn status(&self, at: usize) -> Option<u16> {
        self.entries.get(at).map(|entry| entry.status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All currently held leases, in acquisition order.
    pub fn leases(&self) -> impl Iterator<Item = &Lease6> {
        self.entries.iter().filter_map(|entry| entry.lease.as_ref())
    }

    /// Moves every lease's cltt backward, simulating the passage of
    /// time without waiting for it.
    pub fn rewind_cltt(&mut self, secs: u64) {
        for entry in &mut self.entries {
            if let Some(lease) = &mut entry.lease {
                lease.cltt -= Duration::from_secs(secs);
            }
        }
    }

    fn entry_mut(&mut self, iaid: u32, kind: IaKind) -> Option<&mut LeaseStatus> {
        self.entries
            .iter_mut()
            .find(|entry| entry.iaid == iaid && entry.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::{Configuration, IaKind, Lease6, STATUS_NO_ADDRS_AVAIL, STATUS_SUCCESS};

    fn lease(iaid: u32, kind: IaKind, last_octet: u16) -> Lease6 {
        Lease6 {
            addr: format!("2001:db8::{last_octet:x}").parse().expect("test address"),
            prefix_len: 0,
            kind,
            iaid,
            preferred_lft: 1800,
            valid_lft: 3600,
            cltt: SystemTime::now(),
        }
    }

    #[test]
    fn apply_replaces_by_iaid_and_kind() {
        let mut config = Configuration::default();
        config.apply(lease(1, IaKind::Na, 1), STATUS_SUCCESS);
        config.apply(lease(1, IaKind::Pd, 2), STATUS_SUCCESS);
        assert_eq!(config.len(), 2);

        // same key replaces instead of duplicating
        config.apply(lease(1, IaKind::Na, 3), STATUS_SUCCESS);
        assert_eq!(config.len(), 2);
        let replaced = config.lease(0).expect("replaced lease");
        assert_eq!(
            replaced.addr,
            "2001:db8::3".parse::<std::net::Ipv6Addr>().expect("addr")
        );
    }

    #[test]
    fn mark_status_keeps_existing_lease_untouched() {
        let mut config = Configuration::default();
        let original = lease(7, IaKind::Na, 1);
        config.apply(original.clone(), STATUS_SUCCESS);

        config.mark_status(7, IaKind::Na, STATUS_NO_ADDRS_AVAIL);
        assert_eq!(config.status(0), Some(STATUS_NO_ADDRS_AVAIL));
        assert_eq!(config.lease(0), Some(&original));
    }

    #[test]
    fn mark_status_without_lease_creates_empty_entry() {
        let mut config = Configuration::default();
        config.mark_status(9, IaKind::Pd, STATUS_NO_ADDRS_AVAIL);
        assert_eq!(config.len(), 1);
        assert!(config.lease(0).is_none());
    }

    #[test]
    fn rewind_cltt_shifts_all_leases() {
        let mut config = Configuration::default();
        let before = SystemTime::now();
        config.apply(lease(1, IaKind::Na, 1), STATUS_SUCCESS);
        config.rewind_cltt(600);

        let shifted = config.lease(0).expect("lease").cltt;
        assert!(before.duration_since(shifted).expect("moved backward") >= Duration::from_secs(600));
    }
}
