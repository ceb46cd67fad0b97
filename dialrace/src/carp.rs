//! CARP (Cache Array Routing Protocol) parent selection.
//!
//! CARP deterministically maps a request URL onto one member of a peer
//! array, weighted by configuration, so that sibling proxies sharing the
//! same array agree on which parent caches which URL without any exchange
//! of state. The algorithm follows draft-vinod-carp-v1: a rotate-add hash
//! of the peer name, a rotate-add hash of the request key, a combining
//! step, and a per-peer load multiplier derived from the normalized
//! weights.

use tracing::{debug, trace};
use url::Url;

use crate::peers::{CarpKey, PeerId, PeerRegistry};

/// Derived CARP inputs for one peer, computed by [`initialize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CarpState {
    pub(crate) hash: u32,
    pub(crate) load_factor: f64,
    pub(crate) load_multiplier: f64,
}

/// The rotate-add hash CARP applies to names and request keys.
fn rotate_add_hash(key: &str) -> u32 {
    let mut hash = 0u32;
    for byte in key.bytes() {
        hash = hash.wrapping_add(hash.rotate_left(19)).wrapping_add(u32::from(byte));
    }
    hash
}

/// The peer-name hash gets an extra scramble so that similar names spread.
fn peer_hash(name: &str) -> u32 {
    let mut hash = rotate_add_hash(name);
    hash = hash.wrapping_add(hash.wrapping_mul(0x6253_1965));
    hash.rotate_left(21)
}

/// Assembles the string actually hashed for a request: either the selected
/// URL components, or the whole URL when no key is configured.
fn request_key(url: &Url, key: Option<&CarpKey>) -> String {
    let Some(key) = key else {
        return url.as_str().to_owned();
    };
    let mut out = String::new();
    if key.scheme {
        out.push_str(url.scheme());
    }
    if key.host {
        out.push_str(url.host_str().unwrap_or_default());
    }
    if key.port {
        if let Some(port) = url.port_or_known_default() {
            out.push_str(&port.to_string());
        }
    }
    if key.path {
        out.push_str(url.path());
    }
    if key.params {
        if let Some(query) = url.query() {
            out.push_str(query);
        }
    }
    out
}

/// Computes the per-peer CARP state from the current registry contents.
///
/// Call once after configuration (and again after any reconfiguration).
/// Load factors are the peers' weights normalized over all CARP members;
/// the load multipliers follow the draft's recurrence over members sorted
/// by ascending load factor.
pub fn initialize(registry: &mut PeerRegistry) {
    let mut members: Vec<(PeerId, f64)> = registry
        .iter()
        .filter(|(_, peer)| peer.carp)
        .map(|(id, peer)| (id, f64::from(peer.weight)))
        .collect();
    let total: f64 = members.iter().map(|(_, weight)| weight).sum();
    if members.is_empty() || total <= 0.0 {
        debug!("no CARP-capable peers configured");
        return;
    }
    for (_, weight) in &mut members {
        *weight /= total;
    }
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let count = members.len();
    let mut x_last = 0.0f64;
    let mut p_last = 0.0f64;
    let mut x_n = 1.0f64;
    for (pos, (id, load_factor)) in members.into_iter().enumerate() {
        let kk1 = (count - pos) as f64;
        let mut multiplier = (kk1 * (load_factor - p_last)) / x_n;
        multiplier += x_last.powf(kk1);
        multiplier = multiplier.powf(1.0 / kk1);
        x_n *= multiplier;
        x_last = multiplier;
        p_last = load_factor;

        if let Some(peer) = registry.get_mut(id) {
            peer.carp_state = CarpState {
                hash: peer_hash(&peer.name),
                load_factor,
                load_multiplier: multiplier,
            };
            debug!(%id, name = %peer.name, load_factor, multiplier, "CARP peer initialized");
        }
    }
}

/// Picks the CARP parent for `url`, or `None` when no alive CARP member
/// exists. Dead peers and non-members never match; among the rest the
/// highest combined score wins, so the same URL maps to the same parent on
/// every proxy sharing this configuration.
pub fn select_parent(url: &Url, registry: &PeerRegistry) -> Option<PeerId> {
    let mut best: Option<(PeerId, f64)> = None;
    for (id, peer) in registry.iter() {
        if !peer.carp || !peer.is_alive() {
            continue;
        }
        let key = request_key(url, peer.carp_key.as_ref());
        let mut combined = rotate_add_hash(&key) ^ peer.carp_state.hash;
        combined = combined.wrapping_add(combined.wrapping_mul(0x6253_1965));
        combined = combined.rotate_left(21);
        let score = f64::from(combined) * peer.carp_state.load_multiplier;
        trace!(%id, name = %peer.name, score, "CARP score");
        if best.is_none_or(|(_, high)| score > high) {
            best = Some((id, score));
        }
    }
    best.map(|(id, _)| id)
}
