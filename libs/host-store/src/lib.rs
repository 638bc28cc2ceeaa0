//! # host-store
//!
//! `host-store` defines a trait `HostStore` that provides methods for
//! creating, reading and deleting persisted host reservations, together
//! with commit/rollback semantics over those mutations.
//!
//! Backends are selected at runtime from a connection descriptor
//! (`type=... name=... host=... user=... password=...`) by
//! [`HostStoreFactory`], which owns at most one live backend at a time.
//! Two backends ship with the crate: an in-memory store and a
//! SQLite-backed store.
//!
//! The server measures lease lifetimes from `cltt` (client last
//! transaction time) while the database stores an absolute expiry
//! timestamp; [`expiry_from_cltt`] and [`cltt_from_expiry`] convert
//! between the two representations exactly, to the second.
//!
//! [`HostStore`]: crate::HostStore
//! [`HostStoreFactory`]: crate::factory::HostStoreFactory

use std::net::Ipv6Addr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;

pub mod descriptor;
pub mod factory;
pub mod memory;
pub mod sqlite;

pub use descriptor::Descriptor;
pub use factory::HostStoreFactory;

/// Identity a host record is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostIdentifier {
    /// DHCPv6 client DUID.
    Duid(Vec<u8>),
    /// Link-layer address, for reservations entered by hardware id.
    HwAddr(Vec<u8>),
}

impl HostIdentifier {
    /// Discriminant persisted next to the identifier bytes.
    pub fn kind_tag(&self) -> u8 {
        match self {
            HostIdentifier::Duid(_) => 0,
            HostIdentifier::HwAddr(_) => 1,
        }
    }

    /// Raw identifier bytes.
    pub fn bytes(&self) -> &[u8] {
        match self {
            HostIdentifier::Duid(bytes) | HostIdentifier::HwAddr(bytes) => bytes,
        }
    }
}

/// Whether a record binds a single address or a delegated prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeaseKind {
    Address,
    Prefix,
}

/// A persisted host reservation or active lease.
///
/// `expires_at` is the absolute expiry; the owning server derives it
/// from cltt with [`expiry_from_cltt`] before insertion and recovers
/// cltt with [`cltt_from_expiry`] after reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub identifier: HostIdentifier,
    pub subnet_id: u32,
    pub kind: LeaseKind,
    pub addr: Ipv6Addr,
    /// 0 for plain addresses.
    pub prefix_len: u8,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub expires_at: SystemTime,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to open database: {0}")]
    DbOpen(String),
    #[error("unknown backend type: {0}")]
    InvalidType(String),
    #[error("invalid connection parameter: {0}")]
    InvalidParameter(String),
    #[error("no database name specified in the connection descriptor")]
    NoDatabaseName,
    #[error("host already exists for this identifier and subnet {subnet_id}")]
    DuplicateEntry { subnet_id: u32 },
    #[error("no host store has been created")]
    NoHostStore,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("malformed row in hosts table: {0}")]
    BadRow(String),
}

/// Capability set every storage backend implements.
///
/// Mutations accumulate in a backend-local transaction until
/// [`commit`](HostStore::commit) or [`rollback`](HostStore::rollback);
/// dropping the store discards pending work. A backend only needs to
/// support a single logical caller.
#[async_trait]
pub trait HostStore: std::fmt::Debug + Send + Sync {
    /// Inserts a record. The (identifier, subnet) pair is unique;
    /// collisions fail with [`StoreError::DuplicateEntry`].
    async fn add_host(&self, record: HostRecord) -> Result<(), StoreError>;

    /// Returns the record for this identifier, if any.
    async fn get_host(&self, id: &HostIdentifier) -> Result<Option<HostRecord>, StoreError>;

    /// Deletes every record owned by this identifier. `true` iff at
    /// least one record existed.
    async fn delete_host(&self, id: &HostIdentifier) -> Result<bool, StoreError>;

    /// Atomically applies all mutations since the last commit/rollback.
    async fn commit(&self) -> Result<(), StoreError>;

    /// Atomically discards all mutations since the last commit/rollback.
    async fn rollback(&self) -> Result<(), StoreError>;

    /// Releases the backend's resources. Pending mutations are lost.
    async fn close(&self);

    /// The descriptor `type` tag this backend was created from.
    fn store_type(&self) -> &'static str;
}

/// Seconds from the epoch to `time`, for storage as an integer column.
pub fn systime_epoch(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Inverse of [`systime_epoch`].
pub fn to_systime(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

/// Absolute expiry stored in the database for a lease last touched at
/// `cltt` with the given valid lifetime.
pub fn expiry_from_cltt(cltt: i64, valid_lifetime: u32) -> i64 {
    cltt + i64::from(valid_lifetime)
}

/// Recovers cltt from the stored absolute expiry. Exact inverse of
/// [`expiry_from_cltt`] for every cltt and lifetime.
pub fn cltt_from_expiry(expiry: i64, valid_lifetime: u32) -> i64 {
    expiry - i64::from(valid_lifetime)
}
