//! The resolved security decision for one accepted connection, attached
//! to the socket as an option so downstream filters can consume it
//! without re-deriving anything.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use identity::Identity;
use policy::PolicyInstance;
use transport::{ConnectionSocket, Phase, SocketOption};

/// Re-resolution hooks for downstream consumers that need fresher data
/// than the accept-time snapshot, e.g. a policy check made long after
/// accept.
pub trait PolicyResolver: Send + Sync {
    fn resolve_identity(&self, ip: &IpAddr) -> Identity;
    fn policy(&self, pod_ip: &str) -> Option<Arc<PolicyInstance>>;
}

pub struct Metadata {
    policy: Arc<PolicyInstance>,
    mark: u32,
    identity: Identity,
    ingress: bool,
    port: u16,
    pod_ip: String,
    src_addr: Option<SocketAddr>,
    resolver: Arc<dyn PolicyResolver>,
}

/// The metadata attached to `socket` at accept time, if any.
pub fn get_metadata(socket: &dyn ConnectionSocket) -> Option<&Metadata> {
    socket
        .options()
        .iter()
        .filter_map(|option| option.as_any().downcast_ref::<Metadata>())
        .next()
}

// ===== impl Metadata =====

impl Metadata {
    pub fn new(
        policy: Arc<PolicyInstance>,
        mark: u32,
        identity: Identity,
        ingress: bool,
        port: u16,
        pod_ip: String,
        src_addr: Option<SocketAddr>,
        resolver: Arc<dyn PolicyResolver>,
    ) -> Metadata {
        debug!(
            "metadata: mark={:#x} identity={} ingress={} port={} pod={} src={:?}",
            mark, identity, ingress, port, pod_ip, src_addr
        );
        Metadata {
            policy,
            mark,
            identity,
            ingress,
            port,
            pod_ip,
            src_addr,
            resolver,
        }
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    /// Source security identity resolved at accept time.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn is_ingress(&self) -> bool {
        self.ingress
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pod_ip(&self) -> &str {
        &self.pod_ip
    }

    /// The downstream source address to preserve upstream, when the
    /// connection qualified for original-source preservation.
    pub fn src_addr(&self) -> Option<SocketAddr> {
        self.src_addr
    }

    /// The policy instance looked up at accept time. Stays authoritative
    /// for this connection even if the store is updated afterwards.
    pub fn initial_policy(&self) -> Arc<PolicyInstance> {
        self.policy.clone()
    }

    /// The pod's policy as of now. `None` means the pod has since been
    /// removed from the store, which consumers must be able to observe;
    /// the accept-time instance stays available via `initial_policy`.
    pub fn current_policy(&self) -> Option<Arc<PolicyInstance>> {
        self.resolver.policy(&self.pod_ip)
    }

    pub fn resolve_identity(&self, ip: &IpAddr) -> Identity {
        self.resolver.resolve_identity(ip)
    }
}

impl SocketOption for Metadata {
    fn apply(&self, socket: &mut dyn ConnectionSocket, phase: Phase) -> bool {
        if self.mark == 0 {
            return true;
        }
        if phase != Phase::PreBind {
            trace!("metadata options already applied; phase {:?}", phase);
            return true;
        }
        if let Err(e) = socket.set_mark(self.mark) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                warn!("setting SO_MARK requires CAP_NET_ADMIN: {}", e);
            } else {
                error!("setting SO_MARK failed: {}", e);
                return false;
            }
        }
        if let Some(addr) = self.src_addr {
            if let Err(e) = socket.set_reuse_addr() {
                error!("setting SO_REUSEADDR failed: {}", e);
                return false;
            }
            socket.set_local_addr(addr);
        }
        trace!(
            "applied mark: class {:#x} id-high {:#x} id-low {:#x}",
            self.mark & 0xff00,
            self.mark & 0xff,
            self.mark >> 16
        );
        true
    }

    fn hash_key(&self, key: &mut BytesMut) {
        if self.mark == 0 {
            return;
        }
        match self.src_addr {
            // A preserved source address pins the upstream connection to
            // that exact address.
            Some(addr) => match addr.ip() {
                IpAddr::V4(ip) => key.put_slice(&ip.octets()),
                IpAddr::V6(ip) => key.put_slice(&ip.octets()),
            },
            // Otherwise connections are shareable per source identity.
            None => {
                let id = self.identity.to_u32();
                key.put_u8((id >> 16) as u8);
                key.put_u8((id >> 8) as u8);
                key.put_u8(id as u8);
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("mark", &self.mark)
            .field("identity", &self.identity)
            .field("ingress", &self.ingress)
            .field("port", &self.port)
            .field("pod_ip", &self.pod_ip)
            .field("src_addr", &self.src_addr)
            .finish()
    }
}
