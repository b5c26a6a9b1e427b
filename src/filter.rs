//! Accept-time resolution of a connection's security metadata.
//!
//! For every accepted connection the filter classifies the local pod,
//! looks up its policy, resolves the source and destination identities,
//! computes the connection mark, and attaches the result to the socket
//! as a [`Metadata`] option. The path is synchronous and reads only
//! in-memory tables.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use config::{self, Config};
use conntrack;
use identity::{self, HostTable, Identity, PrefixTable};
use metadata::{Metadata, PolicyResolver};
use policy::{PolicyInstance, PolicyStore};
use registry::{self, Registry};
use store;
use transport::{ConnectionSocket, Transparent};

/// The filter never rejects connections; resolution failures leave the
/// socket without metadata and downstream filters decide what that
/// means.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The connection's addresses are not IP; nothing can be resolved.
    NonIpAddress,
    /// No policy is published for the pod IP.
    PolicyNotFound(String),
}

pub struct Filter {
    is_ingress: bool,
    may_use_original_source_address: bool,
    egress_mark_source_endpoint_id: bool,
    no_local_enforcement: bool,
    identities: Arc<identity::Resolver>,
    conntrack: Option<Arc<conntrack::Tables>>,
    policies: Arc<PolicyStore>,
}

// ===== impl Error =====

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NonIpAddress => write!(f, "connection addresses are not IP"),
            Error::PolicyNotFound(ref pod) => write!(f, "no policy for pod {}", pod),
        }
    }
}

// ===== impl Filter =====

impl Filter {
    /// Builds a filter over the process-wide singletons in `registry`,
    /// creating them on first use. `root` is the opened store root when
    /// the configuration names one.
    ///
    /// The first filter to initialize fixes the identity backend for the
    /// whole process: the store-backed prefix table when the store is
    /// available, the feed-written host table otherwise.
    pub fn new(
        config: &Config,
        registry: &Registry,
        root: Option<Arc<dyn store::Root>>,
    ) -> Result<Filter, config::Error> {
        let conntrack = match root {
            Some(ref root) => {
                let created = root.clone();
                let tables = registry.get_or_create::<conntrack::Tables, _>(
                    registry::CONNTRACK,
                    move || Arc::new(conntrack::Tables::new(created)),
                );
                if tables.root_name() != root.name() {
                    error!(
                        "conntrack tables already opened under {}, not {}",
                        tables.root_name(),
                        root.name()
                    );
                    return Err(config::Error::InconsistentStoreRoot);
                }
                Some(tables)
            }
            None => None,
        };

        // The first filter fixes the backend; later filters must not
        // open (and register) tables the resolver will never consult.
        let identities = match registry.get::<identity::Resolver>(registry::IDENTITY_RESOLVER) {
            Some(identities) => identities,
            None => {
                let backend: Arc<dyn identity::Resolve> = match root {
                    Some(ref root) => match PrefixTable::open(&**root) {
                        Ok(table) => registry.get_or_create::<PrefixTable, _>(
                            registry::PREFIX_TABLE,
                            move || Arc::new(table),
                        ),
                        Err(e) => {
                            info!(
                                "identity store unavailable ({}); using host identities",
                                e
                            );
                            registry.get_or_create::<HostTable, _>(registry::HOST_TABLE, || {
                                Arc::new(HostTable::new())
                            })
                        }
                    },
                    None => registry.get_or_create::<HostTable, _>(registry::HOST_TABLE, || {
                        Arc::new(HostTable::new())
                    }),
                };
                registry.get_or_create::<identity::Resolver, _>(
                    registry::IDENTITY_RESOLVER,
                    move || Arc::new(identity::Resolver::new(backend)),
                )
            }
        };

        let policies = registry
            .get_or_create::<PolicyStore, _>(registry::POLICY_STORE, || Arc::new(PolicyStore::new()));

        Ok(Filter {
            is_ingress: config.is_ingress,
            may_use_original_source_address: config.may_use_original_source_address,
            egress_mark_source_endpoint_id: config.egress_mark_source_endpoint_id,
            no_local_enforcement: config.no_local_enforcement,
            identities,
            conntrack,
            policies,
        })
    }

    /// Resolves and attaches metadata for one accepted connection.
    /// Always lets the connection continue; failures are logged and the
    /// socket is left without metadata.
    pub fn on_accept(self: &Arc<Self>, socket: &mut dyn ConnectionSocket) -> FilterStatus {
        if let Err(e) = self.resolve_metadata(socket) {
            debug!("no metadata attached: {}", e);
        }
        FilterStatus::Continue
    }

    pub fn resolve_metadata(
        self: &Arc<Self>,
        socket: &mut dyn ConnectionSocket,
    ) -> Result<(), Error> {
        let src = socket.remote_addr().ok_or(Error::NonIpAddress)?;
        socket.restore_local_addr();
        let dst = socket.local_addr().ok_or(Error::NonIpAddress)?;
        let src_ip = src.ip();
        let dst_ip = dst.ip();

        // Ingress listeners front the pod as destination; egress as
        // source. The other end is the peer whose identity we resolve.
        let (pod_ip, other_ip) = if self.is_ingress {
            (dst_ip, src_ip)
        } else {
            (src_ip, dst_ip)
        };
        let pod = pod_ip.to_string();
        debug!(
            "{}: pod {} peer {}",
            if self.is_ingress { "ingress" } else { "egress" },
            pod,
            other_ip
        );

        let policy = self.policy_of(&pod).ok_or_else(|| {
            warn!("no policy published for pod {}", pod);
            Error::PolicyNotFound(pod.clone())
        })?;

        // A flow identity recorded by the kernel takes precedence over a
        // fresh resolution of the source address.
        let mut source_identity = Identity::UNRESOLVED;
        if let Some(ref conntrack) = self.conntrack {
            if !policy.conntrack_name().is_empty() {
                source_identity = conntrack.lookup_src_identity(
                    policy.conntrack_name(),
                    &src_ip,
                    &dst_ip,
                    self.is_ingress,
                );
            }
        }
        if !source_identity.is_resolved() {
            source_identity = self.identity_of(&src_ip);
        }

        // Destination identity matters only on egress, where it gates
        // original-source preservation.
        let destination_identity = if self.is_ingress {
            Identity::UNRESOLVED
        } else {
            self.identity_of(&dst_ip)
        };

        // Preserve the downstream source address when marking by
        // endpoint id, or when the destination is a cluster member that
        // is not a pod on this host.
        let src_addr = if (self.egress_mark_source_endpoint_id && policy.endpoint_id() != 0)
            || (self.may_use_original_source_address
                && destination_identity != Identity::WORLD
                && !self.policies.exists(&other_ip.to_string()))
        {
            socket.add_option(Arc::new(Transparent));
            Some(src)
        } else {
            None
        };

        let hint_remote = if self.is_ingress {
            source_identity
        } else {
            destination_identity
        };
        if let Some(proto) = policy.protocol_hint(self.is_ingress, dst.port(), hint_remote) {
            let proto = proto.to_string();
            info!(
                "pod {} port {}: requesting {} parsing",
                pod,
                dst.port(),
                proto
            );
            let mut protocols = socket.requested_protocols();
            protocols.push(proto);
            socket.set_requested_protocols(protocols);
        }

        let mark = if self.no_local_enforcement {
            0
        } else {
            compute_mark(
                self.is_ingress,
                self.egress_mark_source_endpoint_id,
                policy.endpoint_id(),
                source_identity,
            )
        };

        socket.add_option(Arc::new(Metadata::new(
            policy,
            mark,
            source_identity,
            self.is_ingress,
            dst.port(),
            pod,
            src_addr,
            self.clone() as Arc<dyn PolicyResolver>,
        )));
        Ok(())
    }

    /// Resolves `ip`, normalizing lookup misses to `WORLD`.
    fn identity_of(&self, ip: &IpAddr) -> Identity {
        let id = self.identities.resolve(ip);
        if !id.is_resolved() {
            trace!("identity of {} defaults to WORLD", ip);
        }
        id.or_world()
    }

    fn policy_of(&self, pod_ip: &str) -> Option<Arc<PolicyInstance>> {
        match self.policies.get_policy(pod_ip) {
            Some(policy) => Some(policy),
            // Egress listeners marking by endpoint id serve pods with no
            // policy of their own through the allow-all instance.
            None if !self.is_ingress && self.egress_mark_source_endpoint_id => {
                Some(self.policies.allow_all_egress())
            }
            None => None,
        }
    }
}

impl PolicyResolver for Filter {
    fn resolve_identity(&self, ip: &IpAddr) -> Identity {
        self.identity_of(ip)
    }

    fn policy(&self, pod_ip: &str) -> Option<Arc<PolicyInstance>> {
        self.policy_of(pod_ip)
    }
}

/// Encodes the enforcement mark.
///
/// Endpoint-id marking puts the class `0x0900` in the low half and the
/// endpoint id in the high half. Identity marking puts the class
/// (`0x0A00` ingress, `0x0B00` egress) plus the identity's high byte in
/// the low half and the identity's low 16 bits in the high half.
fn compute_mark(
    ingress: bool,
    mark_endpoint_id: bool,
    endpoint_id: u32,
    source_identity: Identity,
) -> u32 {
    if !ingress && mark_endpoint_id && endpoint_id != 0 {
        return 0x0900 | (endpoint_id << 16);
    }
    let class = if ingress { 0x0A00 } else { 0x0B00 };
    let id = source_identity.to_u32();
    class | ((id >> 16) & 0xff) | ((id & 0xffff) << 16)
}
