use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use bytes::BytesMut;

use store;

/// Numeric classification of a network endpoint's workload, independent
/// of its IP address. Only the low 24 bits are significant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(u32);

impl Identity {
    /// Unclassified traffic from outside the managed fleet.
    pub const WORLD: Identity = Identity(2);

    /// A lookup miss. Never stored as final metadata; callers normalize
    /// with `or_world` first.
    pub const UNRESOLVED: Identity = Identity(0);

    pub fn new(id: u32) -> Identity {
        Identity(id & 0x00ff_ffff)
    }

    pub fn is_resolved(&self) -> bool {
        self.0 != 0
    }

    /// `UNRESOLVED` normalizes to `WORLD`; anything else is unchanged.
    pub fn or_world(self) -> Identity {
        if self.0 == 0 {
            Identity::WORLD
        } else {
            self
        }
    }

    pub fn to_u32(&self) -> u32 {
        self.0
    }

    /// Decodes the 4-byte big-endian table value format.
    pub fn from_slice(b: &[u8]) -> Option<Identity> {
        if b.len() != 4 {
            return None;
        }
        let id = (u32::from(b[0]) << 24) | (u32::from(b[1]) << 16) | (u32::from(b[2]) << 8)
            | u32::from(b[3]);
        Some(Identity::new(id))
    }

    /// The 4-byte big-endian table value format.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Resolves an address to a security identity.
pub trait Resolve: Send + Sync {
    /// Returns `Identity::UNRESOLVED` for addresses absent from the table.
    fn resolve(&self, ip: &IpAddr) -> Identity;
}

/// The authoritative identity table, backed by a kernel-resident store
/// table keyed by address prefix. The store performs the longest-prefix
/// match; from this process's perspective a lookup is a non-blocking read
/// of shared memory.
pub struct PrefixTable {
    table: Arc<dyn store::Table>,
}

impl PrefixTable {
    /// Opens the authoritative table under `root`. Failure here means the
    /// store is unavailable and the caller falls back to the host table.
    pub fn open(root: &dyn store::Root) -> io::Result<PrefixTable> {
        let table = root.open(store::IDENTITY_TABLE)?;
        Ok(PrefixTable { table })
    }
}

impl Resolve for PrefixTable {
    fn resolve(&self, ip: &IpAddr) -> Identity {
        let mut key = BytesMut::with_capacity(16);
        store::put_ip(&mut key, ip);
        match self.table.lookup(&key) {
            Some(value) => match Identity::from_slice(&value) {
                Some(id) => id,
                None => {
                    warn!("identity table entry for {} has unexpected length", ip);
                    Identity::UNRESOLVED
                }
            },
            None => Identity::UNRESOLVED,
        }
    }
}

/// Host-granularity identities, written only by the background feed.
/// Readers clone the current snapshot; every update swaps in a complete
/// new one, so a reader never observes a half-applied entry.
pub struct HostTable {
    hosts: RwLock<Arc<HashMap<IpAddr, Identity>>>,
}

impl HostTable {
    pub fn new() -> HostTable {
        HostTable {
            hosts: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn insert(&self, ip: IpAddr, id: Identity) {
        let mut hosts = self.hosts.write().expect("host table lock");
        let mut next = (**hosts).clone();
        next.insert(ip, id);
        *hosts = Arc::new(next);
    }

    pub fn remove(&self, ip: &IpAddr) {
        let mut hosts = self.hosts.write().expect("host table lock");
        let mut next = (**hosts).clone();
        next.remove(ip);
        *hosts = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<HashMap<IpAddr, Identity>> {
        self.hosts.read().expect("host table lock").clone()
    }
}

impl Resolve for HostTable {
    fn resolve(&self, ip: &IpAddr) -> Identity {
        match self.snapshot().get(ip) {
            Some(id) => *id,
            None => Identity::UNRESOLVED,
        }
    }
}

/// The identity backend selected at first successful initialization. The
/// choice between the authoritative prefix table and the host table is
/// made once per process; the lookup path never re-evaluates it.
pub struct Resolver {
    backend: Arc<dyn Resolve>,
}

impl Resolver {
    pub fn new(backend: Arc<dyn Resolve>) -> Resolver {
        Resolver { backend }
    }

    /// Raw resolution; `UNRESOLVED` when the address is not in the table.
    pub fn resolve(&self, ip: &IpAddr) -> Identity {
        self.backend.resolve(ip)
    }
}
