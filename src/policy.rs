use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use identity::Identity;

/// A hint that connections matching a direction, destination port, and
/// remote identity should be handed to an application-protocol parser
/// downstream.
#[derive(Clone, Debug)]
pub struct ProtocolHint {
    pub ingress: bool,
    /// Destination port; 0 matches any port.
    pub port: u16,
    /// Remote identity the hint applies to; `None` matches any.
    pub remote: Option<Identity>,
    pub protocol: String,
}

/// The policy for one pod IP. Immutable once published; shared read-only
/// by any number of concurrent accepts.
#[derive(Clone, Debug)]
pub struct PolicyInstance {
    conntrack_name: String,
    endpoint_id: u32,
    hints: Vec<ProtocolHint>,
}

// ===== impl PolicyInstance =====

impl PolicyInstance {
    pub fn new(conntrack_name: &str, endpoint_id: u32) -> PolicyInstance {
        PolicyInstance {
            conntrack_name: conntrack_name.to_string(),
            endpoint_id,
            hints: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: ProtocolHint) -> PolicyInstance {
        self.hints.push(hint);
        self
    }

    /// Name of the conntrack table recording this pod's flows; empty when
    /// there is none.
    pub fn conntrack_name(&self) -> &str {
        &self.conntrack_name
    }

    /// The local endpoint's id; 0 when there is none.
    pub fn endpoint_id(&self) -> u32 {
        self.endpoint_id
    }

    /// The first protocol hint matching the connection, if any.
    pub fn protocol_hint(&self, ingress: bool, port: u16, remote: Identity) -> Option<&str> {
        self.hints
            .iter()
            .find(|hint| {
                hint.ingress == ingress && (hint.port == 0 || hint.port == port)
                    && hint.remote.map_or(true, |id| id == remote)
            })
            .map(|hint| hint.protocol.as_str())
    }
}

type Snapshot = Arc<IndexMap<String, Arc<PolicyInstance>>>;

/// Maps pod IPs to their policies. Readers take the current snapshot; the
/// background feed swaps in a rebuilt one on every update, so a reader
/// never observes a half-applied entry. Keys are unique and the last
/// update wins.
pub struct PolicyStore {
    by_pod: RwLock<Snapshot>,
    allow_all_egress: Arc<PolicyInstance>,
}

// ===== impl PolicyStore =====

impl PolicyStore {
    pub fn new() -> PolicyStore {
        PolicyStore {
            by_pod: RwLock::new(Arc::new(IndexMap::new())),
            allow_all_egress: Arc::new(PolicyInstance::new("", 0)),
        }
    }

    pub fn get_policy(&self, pod_ip: &str) -> Option<Arc<PolicyInstance>> {
        self.snapshot().get(pod_ip).cloned()
    }

    /// Whether `ip` is a known pod IP, i.e. has a published policy.
    pub fn exists(&self, ip: &str) -> bool {
        self.snapshot().contains_key(ip)
    }

    /// The fallback instance for egress listeners with no policy of their
    /// own.
    pub fn allow_all_egress(&self) -> Arc<PolicyInstance> {
        self.allow_all_egress.clone()
    }

    pub fn update(&self, pod_ip: &str, policy: PolicyInstance) {
        let mut by_pod = self.by_pod.write().expect("policy store lock");
        let mut next = (**by_pod).clone();
        next.insert(pod_ip.to_string(), Arc::new(policy));
        *by_pod = Arc::new(next);
    }

    pub fn remove(&self, pod_ip: &str) {
        let mut by_pod = self.by_pod.write().expect("policy store lock");
        let mut next = (**by_pod).clone();
        next.remove(pod_ip);
        *by_pod = Arc::new(next);
    }

    fn snapshot(&self) -> Snapshot {
        self.by_pod.read().expect("policy store lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use identity::Identity;

    use super::{PolicyInstance, PolicyStore, ProtocolHint};

    #[test]
    fn last_update_wins() {
        let store = PolicyStore::new();
        assert!(store.get_policy("10.0.0.5").is_none());
        assert!(!store.exists("10.0.0.5"));

        store.update("10.0.0.5", PolicyInstance::new("ct-a", 1));
        store.update("10.0.0.5", PolicyInstance::new("ct-b", 2));

        let policy = store.get_policy("10.0.0.5").unwrap();
        assert_eq!(policy.conntrack_name(), "ct-b");
        assert_eq!(policy.endpoint_id(), 2);
        assert!(store.exists("10.0.0.5"));

        store.remove("10.0.0.5");
        assert!(store.get_policy("10.0.0.5").is_none());
    }

    #[test]
    fn published_policies_outlive_store_updates() {
        let store = PolicyStore::new();
        store.update("10.0.0.5", PolicyInstance::new("ct-a", 1));

        let held = store.get_policy("10.0.0.5").unwrap();
        store.update("10.0.0.5", PolicyInstance::new("ct-b", 2));

        // The instance looked up at accept time stays authoritative for
        // that connection.
        assert_eq!(held.conntrack_name(), "ct-a");
    }

    #[test]
    fn allow_all_egress_is_a_singleton() {
        let store = PolicyStore::new();
        let a = store.allow_all_egress();
        let b = store.allow_all_egress();
        assert!(::std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(a.endpoint_id(), 0);
        assert_eq!(a.conntrack_name(), "");
    }

    #[test]
    fn protocol_hints_match_direction_port_and_identity() {
        let policy = PolicyInstance::new("", 0)
            .with_hint(ProtocolHint {
                ingress: false,
                port: 80,
                remote: None,
                protocol: "http".to_string(),
            })
            .with_hint(ProtocolHint {
                ingress: true,
                port: 0,
                remote: Some(Identity::new(42)),
                protocol: "kafka".to_string(),
            });

        assert_eq!(
            policy.protocol_hint(false, 80, Identity::WORLD),
            Some("http")
        );
        assert_eq!(policy.protocol_hint(false, 81, Identity::WORLD), None);
        assert_eq!(
            policy.protocol_hint(true, 9092, Identity::new(42)),
            Some("kafka")
        );
        assert_eq!(policy.protocol_hint(true, 9092, Identity::new(43)), None);
    }
}
