//! Resolved-destination tracking and Happy-Eyeballs connection racing for
//! forwarding proxies.
//!
//! A forwarding transaction resolves one or more candidate destinations —
//! addresses of the origin server and of configured cache peers — and then
//! needs to open a connection to *one* of them, quickly, without burning a
//! candidate that might still be useful. This crate provides the two pieces
//! of that dance:
//!
//! - [`PathSet`]: the per-transaction set of candidate paths, in resolver
//!   arrival order, with the extraction rules a racing driver needs —
//!   front-most candidate, same-family "prime", other-family "spare" — and
//!   explicit retry re-offers for attempts that were aborted rather than
//!   refused.
//! - [`ConnectionOpener`]: the driver itself. It consumes destinations as
//!   resolution produces them, races a prime attempt against a delayed
//!   spare of the other address family, and yields the first connection
//!   that sticks, handing unconsumed candidates back for any later
//!   re-forwarding pass.
//!
//! Peer configuration lives in [`peers`], and [`carp`] implements CARP
//! parent selection over the configured peer array.
//!
//! ```
//! use dialrace::{Destination, PathSet};
//!
//! let mut paths = PathSet::new();
//! paths.add_path(Destination::origin("10.0.0.1:80".parse().unwrap()));
//! paths.add_path(Destination::origin("[2001:db8::1]:80".parse().unwrap()));
//!
//! let first = paths.extract_front().unwrap();
//! assert!(paths.have_spare(&first));
//! let spare = paths.extract_spare(&first).unwrap();
//! assert_ne!(first.family(), spare.family());
//! ```

pub mod carp;
pub mod destination;
pub mod opener;
pub mod path_set;
pub mod peers;
pub mod util;

pub use destination::{AddrFamily, Destination, PeerRef};
pub use opener::{
    ConnectionOpener, Connector, OpenError, Opened, PathFeed, RaceConfig, ResolverUpdate,
    TcpConnector,
};
pub use path_set::{CandidateState, PathSet};
pub use peers::{CachePeer, CarpKey, PeerId, PeerKind, PeerRegistry, PeerStats};

#[cfg(test)]
pub(crate) mod test_utils;
