//! Cache-peer configuration records and the peer registry.
//!
//! A [`CachePeer`] describes one configured next-hop proxy; the
//! [`PeerRegistry`] owns all of them and hands out stable [`PeerId`]s.
//! Path-tracking code only ever carries the id — anything that needs the
//! configuration resolves it through [`PeerRegistry::get`], which answers
//! `None` for ids that no longer resolve instead of dangling.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::carp::CarpState;

/// Stable identity of a configured cache peer within one registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display,
)]
#[display("peer{_0}")]
pub struct PeerId(u64);

impl PeerId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// The relationship we have with a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// A parent we may forward misses through.
    #[default]
    Parent,
    /// A sibling we may only fetch hits from.
    Sibling,
    /// A multicast group member.
    Multicast,
}

/// Which parts of a request URL feed the CARP hash for a peer.
///
/// With no key configured the whole URL string is hashed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarpKey {
    /// Include the URL scheme.
    pub scheme: bool,
    /// Include the host name.
    pub host: bool,
    /// Include the port.
    pub port: bool,
    /// Include the path.
    pub path: bool,
    /// Include the query string.
    pub params: bool,
}

/// Runtime bookkeeping for one peer. Not part of the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    /// Consecutive failed connect attempts since the last success.
    pub connect_failures: u32,
    /// When the most recent connect failure happened.
    pub last_connect_failure: Option<Instant>,
    /// Currently open connections through this peer.
    pub conn_open: u32,
}

/// Configuration of one cache peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePeer {
    /// Unique peer name used for logging and CARP hashing.
    pub name: String,
    /// Host to resolve when dialing this peer.
    pub host: String,
    /// HTTP port on the peer.
    pub http_port: u16,
    /// Parent, sibling or multicast member.
    #[serde(default)]
    pub kind: PeerKind,
    /// Relative request share for load-balanced selection.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Per-peer connect timeout override.
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    /// Consecutive connect failures before the peer counts as dead.
    #[serde(default = "default_connect_fail_limit")]
    pub connect_fail_limit: u32,
    /// Upper bound on simultaneously open connections, if any.
    #[serde(default)]
    pub max_conn: Option<u32>,
    /// Standby connection pool size, if the peer keeps warm spares.
    #[serde(default)]
    pub standby_limit: Option<u32>,
    /// Whether this peer participates in CARP parent selection.
    #[serde(default)]
    pub carp: bool,
    /// URL components hashed for CARP; `None` hashes the whole URL.
    #[serde(default)]
    pub carp_key: Option<CarpKey>,
    /// Runtime state, never serialized.
    #[serde(skip)]
    pub stats: PeerStats,
    #[serde(skip)]
    pub(crate) carp_state: CarpState,
}

fn default_weight() -> u32 {
    1
}

fn default_connect_fail_limit() -> u32 {
    10
}

impl CachePeer {
    /// A parent peer with default tunables.
    pub fn parent(name: impl Into<String>, host: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            http_port,
            kind: PeerKind::Parent,
            weight: default_weight(),
            connect_timeout: None,
            connect_fail_limit: default_connect_fail_limit(),
            max_conn: None,
            standby_limit: None,
            carp: false,
            carp_key: None,
            stats: PeerStats::default(),
            carp_state: CarpState::default(),
        }
    }

    /// Whether the peer is believed reachable. A peer goes dead after
    /// `connect_fail_limit` consecutive connect failures and revives on the
    /// next success.
    pub fn is_alive(&self) -> bool {
        self.stats.connect_failures < self.connect_fail_limit
    }

    /// Whether another connection may be opened under `max_conn`.
    pub fn can_open_more(&self) -> bool {
        self.max_conn
            .is_none_or(|limit| self.stats.conn_open < limit)
    }

    /// Records an established connection to this peer.
    pub fn note_connect_success(&mut self) {
        self.stats.connect_failures = 0;
        self.stats.conn_open += 1;
    }

    /// Records a failed connect attempt.
    pub fn note_connect_failure(&mut self) {
        self.stats.connect_failures = self.stats.connect_failures.saturating_add(1);
        self.stats.last_connect_failure = Some(Instant::now());
    }

    /// Records a connection through this peer going away.
    pub fn note_closed(&mut self) {
        self.stats.conn_open = self.stats.conn_open.saturating_sub(1);
    }

    /// The connect timeout to use for this peer.
    pub fn connect_timeout_or(&self, default: Duration) -> Duration {
        self.connect_timeout.unwrap_or(default)
    }
}

/// All configured cache peers, keyed by [`PeerId`].
///
/// Ids are handed out monotonically and never reused, so a stale id held by
/// long-lived path state resolves to `None` rather than to the wrong peer.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<(PeerId, CachePeer)>,
    next_id: u64,
}

impl PeerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer and returns its id.
    pub fn add(&mut self, peer: CachePeer) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        self.peers.push((id, peer));
        id
    }

    /// Resolves an id; `None` if it was never handed out by this registry.
    pub fn get(&self, id: PeerId) -> Option<&CachePeer> {
        self.peers
            .binary_search_by_key(&id, |(id, _)| *id)
            .ok()
            .map(|idx| &self.peers[idx].1)
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut CachePeer> {
        self.peers
            .binary_search_by_key(&id, |(id, _)| *id)
            .ok()
            .map(|idx| &mut self.peers[idx].1)
    }

    /// Looks a peer up by its configured name.
    pub fn find_by_name(&self, name: &str) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.name == name)
            .map(|(id, _)| *id)
    }

    /// All peers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &CachePeer)> {
        self.peers.iter().map(|(id, peer)| (*id, peer))
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
