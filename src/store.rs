//! Opaque access to kernel-resident lookup tables.
//!
//! The kernel-side layout is not this crate's concern: a `Root` opens
//! named tables and a `Table` answers byte-keyed lookups. `MemRoot`
//! provides the same contract in memory for tests and for deployments
//! without a local store.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use ipnet::{Contains, IpNet};

/// Name of the authoritative address-to-identity table.
pub const IDENTITY_TABLE: &str = "ip_identity";

/// A root under which named tables can be opened, typically a filesystem
/// path where the kernel pins its maps.
pub trait Root: Send + Sync {
    /// Identifies this root. Filter instances in one process must all
    /// name the same root; this is what the check compares.
    fn name(&self) -> &str;

    fn open(&self, table: &str) -> io::Result<Arc<dyn Table>>;
}

/// One opened table. Lookups read the current table state without
/// blocking; the table's contents are maintained outside this process.
pub trait Table: Send + Sync {
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// Appends the raw octets of `ip` (4 bytes for v4, 16 for v6).
pub fn put_ip(key: &mut BytesMut, ip: &IpAddr) {
    match *ip {
        IpAddr::V4(ref addr) => key.put_slice(&addr.octets()),
        IpAddr::V6(ref addr) => key.put_slice(&addr.octets()),
    }
}

/// An in-memory `Root`. Tables must be created with `table` before they
/// can be opened, so tests can exercise open failures.
pub struct MemRoot {
    name: String,
    tables: Mutex<HashMap<String, Arc<MemTable>>>,
}

impl MemRoot {
    pub fn new(name: &str) -> MemRoot {
        MemRoot {
            name: name.to_string(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the named table, creating it if it does not exist yet.
    pub fn table(&self, name: &str) -> Arc<MemTable> {
        let mut tables = self.tables.lock().expect("store lock");
        tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemTable::new()))
            .clone()
    }
}

impl Root for MemRoot {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, table: &str) -> io::Result<Arc<dyn Table>> {
        let tables = self.tables.lock().expect("store lock");
        match tables.get(table) {
            Some(t) => Ok(t.clone() as Arc<dyn Table>),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such table: {}", table),
            )),
        }
    }
}

/// An in-memory `Table` holding exact-key entries plus prefix entries
/// matched the way a kernel longest-prefix-match table would.
pub struct MemTable {
    exact: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    nets: Mutex<Vec<(IpNet, Vec<u8>)>>,
}

impl MemTable {
    pub fn new() -> MemTable {
        MemTable {
            exact: Mutex::new(HashMap::new()),
            nets: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.exact.lock().expect("store lock").insert(key, value);
    }

    pub fn remove(&self, key: &[u8]) {
        self.exact.lock().expect("store lock").remove(key);
    }

    pub fn insert_net(&self, net: IpNet, value: Vec<u8>) {
        self.nets.lock().expect("store lock").push((net, value));
    }
}

impl Table for MemTable {
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.exact.lock().expect("store lock").get(key) {
            return Some(value.clone());
        }
        let ip = match ip_from_key(key) {
            Some(ip) => ip,
            None => return None,
        };
        let nets = self.nets.lock().expect("store lock");
        let mut best: Option<&(IpNet, Vec<u8>)> = None;
        for entry in nets.iter() {
            if entry.0.contains(&ip) {
                let better = match best {
                    Some(b) => entry.0.prefix_len() > b.0.prefix_len(),
                    None => true,
                };
                if better {
                    best = Some(entry);
                }
            }
        }
        best.map(|entry| entry.1.clone())
    }
}

fn ip_from_key(key: &[u8]) -> Option<IpAddr> {
    match key.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(key);
            Some(IpAddr::V4(octets.into()))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(key);
            Some(IpAddr::V6(octets.into()))
        }
        _ => None,
    }
}
