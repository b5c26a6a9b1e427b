#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use flowmark::transport::{ConnectionSocket, SocketOption};

pub fn init() {
    let _ = ::env_logger::try_init();
}

/// A `ConnectionSocket` that records every operation applied to it.
pub struct MockSocket {
    pub remote: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    pub restored: bool,
    pub protocols: Vec<String>,
    pub options: Vec<Arc<dyn SocketOption>>,
    pub marks: Vec<u32>,
    pub reuse_addr: bool,
    pub transparent: bool,
    pub local_override: Option<SocketAddr>,
    pub mark_error: Option<io::ErrorKind>,
}

impl MockSocket {
    pub fn new(remote: &str, local: &str) -> MockSocket {
        MockSocket {
            remote: Some(remote.parse().expect("remote addr")),
            local: Some(local.parse().expect("local addr")),
            restored: false,
            protocols: Vec::new(),
            options: Vec::new(),
            marks: Vec::new(),
            reuse_addr: false,
            transparent: false,
            local_override: None,
            mark_error: None,
        }
    }

    /// A socket whose addresses cannot be expressed as IP, e.g. a unix
    /// domain socket.
    pub fn non_ip() -> MockSocket {
        let mut socket = MockSocket::new("127.0.0.1:1", "127.0.0.1:1");
        socket.remote = None;
        socket.local = None;
        socket
    }
}

impl ConnectionSocket for MockSocket {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_override.or(self.local)
    }

    fn restore_local_addr(&mut self) {
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
        if let Some(kind) = self.mark_error {
            return Err(io::Error::new(kind, "sockopt"));
        }
        self.marks.push(mark);
        Ok(())
    }

    fn set_reuse_addr(&mut self) -> io::Result<()> {
        self.reuse_addr = true;
        Ok(())
    }

    fn set_transparent(&mut self) -> io::Result<()> {
        self.transparent = true;
        Ok(())
    }

    fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local_override = Some(addr);
    }
}
