//! Applies control-plane updates to the process-wide tables.
//!
//! The transport that carries the subscription is not this module's
//! concern; whatever receives updates pushes them through a [`Feeder`]
//! and the returned task applies them on the control-plane executor.
//! Accept-time readers only ever observe complete snapshots.

use futures::{Future, Stream};
use futures::sync::mpsc;

use std::net::IpAddr;
use std::sync::Arc;

use identity::{HostTable, Identity};
use policy::{PolicyInstance, PolicyStore};
use registry::{self, Registry};

#[derive(Debug)]
pub enum Update {
    Policy(String, PolicyInstance),
    RemovePolicy(String),
    Host(IpAddr, Identity),
    RemoveHost(IpAddr),
}

/// The sending side of the update channel. Cheap to clone.
#[derive(Clone)]
pub struct Feeder {
    tx: mpsc::UnboundedSender<Update>,
}

/// Builds a feeder over the tables in `registry`, plus the task that
/// drains it. Create the feed after the filters so the identity backend
/// they selected is visible: host updates are dropped when the process
/// resolves identities from the store instead.
pub fn new(registry: &Registry) -> (Feeder, Box<dyn Future<Item = (), Error = ()> + Send>) {
    let policies = registry
        .get_or_create::<PolicyStore, _>(registry::POLICY_STORE, || Arc::new(PolicyStore::new()));
    let hosts = registry.get::<HostTable>(registry::HOST_TABLE);

    let (tx, rx) = mpsc::unbounded();
    let task = rx.for_each(move |update| {
        apply(&policies, hosts.as_ref(), update);
        Ok(())
    });
    (Feeder { tx }, Box::new(task))
}

fn apply(policies: &PolicyStore, hosts: Option<&Arc<HostTable>>, update: Update) {
    match update {
        Update::Policy(pod_ip, policy) => {
            debug!("policy update for pod {}", pod_ip);
            policies.update(&pod_ip, policy);
        }
        Update::RemovePolicy(pod_ip) => {
            debug!("policy removed for pod {}", pod_ip);
            policies.remove(&pod_ip);
        }
        Update::Host(ip, id) => match hosts {
            Some(hosts) => hosts.insert(ip, id),
            None => trace!("host identity update for {} ignored; store-backed", ip),
        },
        Update::RemoveHost(ip) => match hosts {
            Some(hosts) => hosts.remove(&ip),
            None => trace!("host identity removal for {} ignored; store-backed", ip),
        },
    }
}

// ===== impl Feeder =====

impl Feeder {
    pub fn send(&self, update: Update) {
        if let Err(e) = self.tx.unbounded_send(update) {
            // The task was dropped; updates have nowhere to go.
            warn!("update channel closed: {:?}", e.into_inner());
        }
    }
}
