//! Resolves, for every newly accepted connection on a workload's data-path
//! proxy, the security identity of the connection's two endpoints and the
//! network policy governing the connection, and encodes the decision as
//! socket-level metadata: a connection mark, an optional original-source
//! address override, an application-protocol hint, and a connection-pool
//! partition key. Downstream filters consume the attached [`Metadata`]
//! instead of re-deriving any of it.
//!
//! The accept-time path is synchronous and reads only in-memory tables.
//! The tables are process-wide singletons kept fresh by a background feed
//! (see the `feed` module); refreshes swap complete snapshots so readers
//! never observe a half-applied update.

extern crate bytes;
extern crate futures;
extern crate indexmap;
extern crate ipnet;
#[cfg(target_os = "linux")]
extern crate libc;
#[macro_use]
extern crate log;
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod config;
pub mod conntrack;
pub mod feed;
pub mod filter;
pub mod identity;
pub mod metadata;
pub mod policy;
pub mod registry;
pub mod store;
pub mod transport;

pub use config::Config;
pub use filter::{Filter, FilterStatus};
pub use identity::Identity;
pub use metadata::{get_metadata, Metadata};
pub use registry::Registry;
