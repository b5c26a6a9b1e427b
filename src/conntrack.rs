//! Lookup of previously recorded flow identities.
//!
//! An established flow may have been NAT-rewritten or reclassified after
//! its first packet; the identity recorded for the flow takes precedence
//! over a fresh resolution of the now-translated source address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};

use identity::Identity;
use store;

/// The set of conntrack tables under one store root. Tables are opened
/// lazily, by the name the pod's policy carries, and cached.
pub struct Tables {
    root: Arc<dyn store::Root>,
    open: Mutex<HashMap<String, Arc<dyn store::Table>>>,
}

/// The key for one flow: a direction byte followed by the raw source and
/// destination address octets.
pub fn flow_key(src: &IpAddr, dst: &IpAddr, ingress: bool) -> Vec<u8> {
    let mut key = BytesMut::with_capacity(33);
    key.put_u8(if ingress { 1 } else { 0 });
    store::put_ip(&mut key, src);
    store::put_ip(&mut key, dst);
    key.to_vec()
}

// ===== impl Tables =====

impl Tables {
    pub fn new(root: Arc<dyn store::Root>) -> Tables {
        Tables {
            root,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// The root these tables were opened under.
    pub fn root_name(&self) -> String {
        self.root.name().to_string()
    }

    /// The source identity recorded for the flow, or `UNRESOLVED` when
    /// the table cannot be opened or holds no entry.
    pub fn lookup_src_identity(
        &self,
        name: &str,
        src: &IpAddr,
        dst: &IpAddr,
        ingress: bool,
    ) -> Identity {
        let table = match self.table(name) {
            Some(table) => table,
            None => return Identity::UNRESOLVED,
        };
        match table.lookup(&flow_key(src, dst, ingress)) {
            Some(value) => match Identity::from_slice(&value) {
                Some(id) => {
                    trace!("conntrack {}: flow identity {}", name, id);
                    id
                }
                None => {
                    warn!("conntrack {}: entry has unexpected length", name);
                    Identity::UNRESOLVED
                }
            },
            None => Identity::UNRESOLVED,
        }
    }

    fn table(&self, name: &str) -> Option<Arc<dyn store::Table>> {
        let mut open = self.open.lock().expect("conntrack lock");
        if let Some(table) = open.get(name) {
            return Some(table.clone());
        }
        match self.root.open(name) {
            Ok(table) => {
                open.insert(name.to_string(), table.clone());
                Some(table)
            }
            Err(e) => {
                debug!("conntrack table {} unavailable: {}", name, e);
                None
            }
        }
    }
}
