use std::any::Any;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use bytes::BytesMut;

use super::sockopt;

/// Where the upstream connection is in its lifecycle when options are
/// applied. Address-affecting options only take effect before bind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    PreBind,
    Bound,
    Listening,
}

/// An option attached to an accepted connection, applied to the upstream
/// socket as it is brought up. Options also contribute to the key that
/// partitions upstream connection pools.
pub trait SocketOption: Send + Sync {
    /// Applies this option at `phase`. Returning `false` aborts the
    /// upstream connection attempt.
    fn apply(&self, socket: &mut dyn ConnectionSocket, phase: Phase) -> bool;

    /// Appends this option's contribution to the pool partition key.
    /// Options that do not affect connection reuse append nothing.
    fn hash_key(&self, key: &mut BytesMut);

    fn as_any(&self) -> &dyn Any;
}

/// The mutable view of a connection a `SocketOption` operates on.
pub trait ConnectionSocket {
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Recovers the pre-redirect destination address on sockets accepted
    /// through an iptables-style redirect.
    fn restore_local_addr(&mut self);

    fn requested_protocols(&self) -> Vec<String>;
    fn set_requested_protocols(&mut self, protocols: Vec<String>);

    fn add_option(&mut self, option: Arc<dyn SocketOption>);
    fn options(&self) -> &[Arc<dyn SocketOption>];

    fn set_mark(&mut self, mark: u32) -> io::Result<()>;
    fn set_reuse_addr(&mut self) -> io::Result<()>;
    fn set_transparent(&mut self) -> io::Result<()>;

    /// Overrides the address the upstream socket will bind to.
    fn set_local_addr(&mut self, addr: SocketAddr);
}

/// Applies every attached option at `phase`; `false` if any option
/// failed.
pub fn apply_options(socket: &mut dyn ConnectionSocket, phase: Phase) -> bool {
    let options = socket.options().to_vec();
    let mut ok = true;
    for option in &options {
        ok = option.apply(socket, phase) && ok;
    }
    ok
}

/// Marks the upstream socket `IP_TRANSPARENT` so it may bind to the
/// downstream peer's address.
pub struct Transparent;

/// A `ConnectionSocket` over a live `TcpStream`.
pub struct TcpSocket {
    stream: TcpStream,
    restored: bool,
    local_override: Option<SocketAddr>,
    protocols: Vec<String>,
    options: Vec<Arc<dyn SocketOption>>,
}

// ===== impl Transparent =====

impl SocketOption for Transparent {
    fn apply(&self, socket: &mut dyn ConnectionSocket, phase: Phase) -> bool {
        if phase != Phase::PreBind {
            return true;
        }
        match socket.set_transparent() {
            Ok(()) => true,
            Err(ref e) if e.kind() == io::ErrorKind::PermissionDenied => {
                // Running without CAP_NET_ADMIN; carry on unmarked rather
                // than fail every upstream connection.
                warn!("setting IP_TRANSPARENT requires CAP_NET_ADMIN: {}", e);
                true
            }
            Err(e) => {
                error!("setting IP_TRANSPARENT failed: {}", e);
                false
            }
        }
    }

    fn hash_key(&self, _key: &mut BytesMut) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ===== impl TcpSocket =====

impl TcpSocket {
    pub fn new(stream: TcpStream) -> TcpSocket {
        TcpSocket {
            stream,
            restored: false,
            local_override: None,
            protocols: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn local_addr_restored(&self) -> bool {
        self.restored
    }
}

impl ConnectionSocket for TcpSocket {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_override.or_else(|| self.stream.local_addr().ok())
    }

    fn restore_local_addr(&mut self) {
        // The stream's local address already reflects any redirect
        // performed before accept; record that it is authoritative.
        self.restored = true;
    }

    fn requested_protocols(&self) -> Vec<String> {
        self.protocols.clone()
    }

    fn set_requested_protocols(&mut self, protocols: Vec<String>) {
        self.protocols = protocols;
    }

    fn add_option(&mut self, option: Arc<dyn SocketOption>) {
        self.options.push(option);
    }

    fn options(&self) -> &[Arc<dyn SocketOption>] {
        &self.options
    }

    fn set_mark(&mut self, mark: u32) -> io::Result<()> {
        sockopt::set_mark(&self.stream, mark)
    }

    fn set_reuse_addr(&mut self) -> io::Result<()> {
        sockopt::set_reuse_addr(&self.stream)
    }

    fn set_transparent(&mut self) -> io::Result<()> {
        sockopt::set_transparent(&self.stream)
    }

    fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local_override = Some(addr);
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use bytes::BytesMut;

    use super::{apply_options, ConnectionSocket, Phase, SocketOption};

    #[derive(Default)]
    struct Recorder {
        options: Vec<Arc<dyn SocketOption>>,
        transparent: usize,
        deny: bool,
    }

    impl ConnectionSocket for Recorder {
        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn restore_local_addr(&mut self) {}
        fn requested_protocols(&self) -> Vec<String> {
            Vec::new()
        }
        fn set_requested_protocols(&mut self, _: Vec<String>) {}
        fn add_option(&mut self, option: Arc<dyn SocketOption>) {
            self.options.push(option);
        }
        fn options(&self) -> &[Arc<dyn SocketOption>] {
            &self.options
        }
        fn set_mark(&mut self, _: u32) -> io::Result<()> {
            Ok(())
        }
        fn set_reuse_addr(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn set_transparent(&mut self) -> io::Result<()> {
            self.transparent += 1;
            if self.deny {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "EPERM"))
            } else {
                Ok(())
            }
        }
        fn set_local_addr(&mut self, _: SocketAddr) {}
    }

    struct Fails;

    impl SocketOption for Fails {
        fn apply(&self, _: &mut dyn ConnectionSocket, _: Phase) -> bool {
            false
        }
        fn hash_key(&self, _: &mut BytesMut) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn transparent_applies_pre_bind_only() {
        let mut socket = Recorder::default();
        socket.add_option(Arc::new(super::Transparent));

        assert!(apply_options(&mut socket, Phase::Bound));
        assert_eq!(socket.transparent, 0);

        assert!(apply_options(&mut socket, Phase::PreBind));
        assert_eq!(socket.transparent, 1);
    }

    #[test]
    fn transparent_tolerates_missing_privileges() {
        let mut socket = Recorder::default();
        socket.deny = true;
        socket.add_option(Arc::new(super::Transparent));
        assert!(apply_options(&mut socket, Phase::PreBind));
    }

    #[test]
    fn any_failing_option_fails_the_socket() {
        let mut socket = Recorder::default();
        socket.add_option(Arc::new(super::Transparent));
        socket.add_option(Arc::new(Fails));
        assert!(!apply_options(&mut socket, Phase::PreBind));
        // The transparent option still ran.
        assert_eq!(socket.transparent, 1);
    }

    #[test]
    fn transparent_contributes_nothing_to_the_key() {
        let mut key = BytesMut::new();
        super::Transparent.hash_key(&mut key);
        assert!(key.is_empty());
    }
}
