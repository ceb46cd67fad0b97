//! The per-transaction set of candidate paths and its extraction rules.
//!
//! A [`PathSet`] holds every destination resolved for one transaction, in
//! arrival order, together with per-entry availability. The connection opener
//! pulls candidates out of it in a controlled order: front-most for a fresh
//! start, same-family ("prime") to keep feeding an ongoing attempt, or
//! other-family ("spare") for Happy-Eyeballs racing. Entries are never
//! removed; an extracted entry only becomes eligible again through an
//! explicit [`PathSet::retry_path`] re-offer.

use std::fmt;

use tracing::trace;

use crate::destination::{AddrFamily, Destination};

/// A tracked candidate path.
#[derive(Debug, Clone)]
struct PathEntry {
    dest: Destination,
    /// Whether this address may still be used (i.e. has not been extracted).
    available: bool,
}

/// Classification of the candidates matching some selector (same-peer prime,
/// same-peer spare).
///
/// `done_with_*` answers are derived from this; callers that need to
/// distinguish "all candidates failed for good" from "candidates are tied up
/// in attempts that may yet be re-offered" read it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// At least one matching candidate is available right now.
    Untried,
    /// Matching candidates exist, but all are extracted; a retry re-offer
    /// could bring one back.
    AwaitingRetry,
    /// No matching candidate was ever added.
    Exhausted,
}

/// Candidate paths for one transaction, in resolver arrival order.
///
/// Arrival order is preserved unconditionally: the upstream resolver emits
/// addresses grouped peer-then-family, and prime/spare selection relies on
/// that grouping. The only ordering optimization is `skip_from_front`, the
/// length of the fully-unavailable front segment; it makes repeated front
/// extraction amortized O(1) while leaving mid-sequence holes untouched.
#[derive(Debug, Default)]
pub struct PathSet {
    paths: Vec<PathEntry>,
    /// Number of leading entries that are all unavailable; equivalently the
    /// index of the first possibly-available candidate. Never points below an
    /// available entry.
    skip_from_front: usize,
    finalized: bool,
    notification_pending: bool,
}

impl PathSet {
    /// An empty set awaiting resolver output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a candidate path to try after all existing ones.
    pub fn add_path(&mut self, dest: Destination) {
        trace!(%dest, total = self.paths.len() + 1, "new candidate path");
        self.paths.push(PathEntry {
            dest,
            available: true,
        });
    }

    /// Re-offers a previously extracted destination at its original position.
    ///
    /// Used when an attempt ended without a definitive failure (aborted,
    /// lost a race) and the address deserves reconsideration. The matching
    /// entry must currently be unavailable; re-offering an address that was
    /// never added, or that is still available, is caller misuse and panics.
    pub fn retry_path(&mut self, dest: &Destination) {
        let idx = self
            .paths
            .iter()
            .position(|entry| !entry.available && entry.dest == *dest);
        let Some(idx) = idx else {
            panic!("retry of a destination that is not awaiting retry: {dest}");
        };
        self.paths[idx].available = true;
        // the entry below the skip point is a candidate again
        if idx < self.skip_from_front {
            self.skip_from_front = idx;
        }
        trace!(%dest, idx, "candidate path re-offered");
    }

    /// Extracts the first available destination in arrival order.
    pub fn extract_front(&mut self) -> Option<Destination> {
        self.compact_front();
        if self.skip_from_front < self.paths.len() {
            Some(self.take_at(self.skip_from_front, "front"))
        } else {
            None
        }
    }

    /// Extracts the first available same-peer same-family candidate.
    pub fn extract_prime(&mut self, current: &Destination) -> Option<Destination> {
        self.compact_front();
        self.find_from_skip(current, current.family())
            .map(|idx| self.take_at(idx, "prime"))
    }

    /// Extracts the first available same-peer other-family candidate.
    pub fn extract_spare(&mut self, current: &Destination) -> Option<Destination> {
        self.compact_front();
        self.find_from_skip(current, current.family().other())
            .map(|idx| self.take_at(idx, "spare"))
    }

    /// Whether [`extract_spare`](Self::extract_spare) would currently return
    /// a destination. Side-effect free and exact.
    pub fn have_spare(&self, current: &Destination) -> bool {
        self.find_from_skip(current, current.family().other())
            .is_some()
    }

    /// Remaining same-peer same-family candidates for `current`.
    pub fn prime_state(&self, current: &Destination) -> CandidateState {
        self.classify(current, current.family())
    }

    /// Remaining same-peer other-family candidates for `current`.
    pub fn spare_state(&self, current: &Destination) -> CandidateState {
        self.classify(current, current.family().other())
    }

    /// Whether [`extract_prime`](Self::extract_prime) is guaranteed to keep
    /// returning `None` for this peer. Never true before finalization: an
    /// unfinished resolver may still add a matching candidate.
    pub fn done_with_primes(&self, current: &Destination) -> bool {
        self.finalized && self.prime_state(current) != CandidateState::Untried
    }

    /// Whether [`extract_spare`](Self::extract_spare) is guaranteed to keep
    /// returning `None` for this peer.
    pub fn done_with_spares(&self, current: &Destination) -> bool {
        self.finalized && self.spare_state(current) != CandidateState::Untried
    }

    /// Whether both primes and spares are done for `current`'s peer.
    pub fn done_with_peer(&self, current: &Destination) -> bool {
        self.done_with_primes(current) && self.done_with_spares(current)
    }

    /// Marks the set complete: the resolver guarantees no further
    /// [`add_path`](Self::add_path) calls for this transaction.
    pub fn finalize(&mut self) {
        debug_assert!(!self.finalized, "destinations finalized twice");
        self.finalized = true;
    }

    /// Whether all destinations for this transaction have been received.
    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Whether a "candidates changed" wake-up is already scheduled.
    pub fn notification_pending(&self) -> bool {
        self.notification_pending
    }

    /// Records that a wake-up has been scheduled. Returns `false` if one was
    /// already pending, letting bursts of additions coalesce into a single
    /// notification.
    pub fn schedule_notification(&mut self) -> bool {
        !std::mem::replace(&mut self.notification_pending, true)
    }

    /// Clears the pending wake-up; returns whether one was pending.
    pub fn consume_notification(&mut self) -> bool {
        std::mem::take(&mut self.notification_pending)
    }

    /// Whether the set holds no entries at all. This distinguishes "nothing
    /// resolved yet" from "everything tried": extracted entries still count.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Total entry count, available or not. Diagnostics only.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Number of entries currently available for extraction.
    pub fn available(&self) -> usize {
        self.paths.iter().filter(|entry| entry.available).count()
    }

    /// Folds the unavailable front run into `skip_from_front`.
    fn compact_front(&mut self) {
        debug_assert!(self.skip_from_front <= self.paths.len());
        while self
            .paths
            .get(self.skip_from_front)
            .is_some_and(|entry| !entry.available)
        {
            self.skip_from_front += 1;
        }
    }

    /// First available index at or after the skip point matching the peer of
    /// `current` and `family`.
    fn find_from_skip(&self, current: &Destination, family: AddrFamily) -> Option<usize> {
        self.paths
            .iter()
            .enumerate()
            .skip(self.skip_from_front)
            .find(|(_, entry)| {
                entry.available
                    && entry.dest.same_peer(current)
                    && entry.dest.family() == family
            })
            .map(|(idx, _)| idx)
    }

    /// Classifies all entries matching the peer of `current` and `family`,
    /// extracted or not.
    fn classify(&self, current: &Destination, family: AddrFamily) -> CandidateState {
        let mut seen = false;
        for entry in &self.paths {
            if entry.dest.same_peer(current) && entry.dest.family() == family {
                if entry.available {
                    return CandidateState::Untried;
                }
                seen = true;
            }
        }
        if seen {
            CandidateState::AwaitingRetry
        } else {
            CandidateState::Exhausted
        }
    }

    /// Marks the entry at `idx` unavailable and hands out its destination.
    fn take_at(&mut self, idx: usize, what: &str) -> Destination {
        let entry = &mut self.paths[idx];
        debug_assert!(entry.available);
        entry.available = false;
        if idx == self.skip_from_front {
            self.skip_from_front += 1;
        }
        let dest = entry.dest.clone();
        trace!(%dest, what, idx, "extracted candidate path");
        dest
    }

    #[cfg(test)]
    fn assert_skip_invariant(&self) {
        assert!(self.skip_from_front <= self.paths.len());
        assert!(
            self.paths[..self.skip_from_front]
                .iter()
                .all(|entry| !entry.available),
            "available entry below the skip point"
        );
    }
}

impl fmt::Display for PathSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "paths {} ({} available)", self.len(), self.available())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use proptest::prelude::*;

    use super::*;
    use crate::peers::PeerId;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn origin4(last: u8) -> Destination {
        Destination::origin(sa(&format!("10.0.0.{last}:80")))
    }

    fn peer4(peer: u64, last: u8) -> Destination {
        Destination::via_peer(PeerId::from_raw(peer), sa(&format!("10.0.{peer}.{last}:3128")))
    }

    fn peer6(peer: u64, last: u8) -> Destination {
        Destination::via_peer(
            PeerId::from_raw(peer),
            sa(&format!("[2001:db8::{peer}:{last}]:3128")),
        )
    }

    #[test]
    fn fresh_set_is_empty() {
        let mut set = PathSet::new();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
        assert_eq!(set.extract_front(), None);
        // not done before finalization, done after
        let probe = origin4(1);
        assert!(!set.done_with_primes(&probe));
        assert!(!set.done_with_peer(&probe));
        set.finalize();
        assert!(set.done_with_primes(&probe));
        assert!(set.done_with_peer(&probe));
        assert_eq!(set.prime_state(&probe), CandidateState::Exhausted);
    }

    #[test]
    fn front_extraction_is_fifo() {
        let mut set = PathSet::new();
        let dests = [origin4(1), peer4(1, 1), peer6(1, 2), origin4(2)];
        for d in &dests {
            set.add_path(d.clone());
        }
        for d in &dests {
            assert_eq!(set.extract_front().as_ref(), Some(d));
        }
        assert_eq!(set.extract_front(), None);
        assert_eq!(set.len(), 4);
        assert_eq!(set.available(), 0);
    }

    #[test]
    fn prime_and_spare_respect_family_and_peer() {
        let mut set = PathSet::new();
        set.add_path(peer4(1, 1));
        set.add_path(peer6(1, 1));
        set.add_path(peer4(2, 1));
        set.add_path(peer6(2, 1));

        let current = set.extract_front().unwrap();
        assert_eq!(current, peer4(1, 1));

        // spare: same peer, other family; never crosses peers
        assert!(set.have_spare(&current));
        assert_eq!(set.extract_spare(&current), Some(peer6(1, 1)));
        assert!(!set.have_spare(&current));
        assert_eq!(set.extract_spare(&current), None);

        // peer 2's addresses are untouched
        let current2 = peer4(2, 1);
        assert_eq!(set.extract_prime(&current2), Some(peer4(2, 1)));
        assert_eq!(set.extract_spare(&current2), Some(peer6(2, 1)));
    }

    #[test]
    fn prime_skips_other_family() {
        let mut set = PathSet::new();
        set.add_path(peer4(1, 1));
        set.add_path(peer6(1, 1));
        set.add_path(peer4(1, 2));

        let current = set.extract_front().unwrap();
        // next prime is the second v4 address, not the v6 one in between
        assert_eq!(set.extract_prime(&current), Some(peer4(1, 2)));
        assert_eq!(set.extract_prime(&current), None);
    }

    #[test]
    fn retry_restores_extraction() {
        let mut set = PathSet::new();
        let a = origin4(1);
        set.add_path(a.clone());
        assert_eq!(set.extract_front(), Some(a.clone()));
        assert_eq!(set.extract_front(), None);
        set.retry_path(&a);
        assert_eq!(set.extract_front(), Some(a));
        assert_eq!(set.extract_front(), None);
    }

    #[test]
    fn retry_lowers_the_skip_point() {
        let mut set = PathSet::new();
        let dests = [origin4(1), origin4(2), origin4(3)];
        for d in &dests {
            set.add_path(d.clone());
        }
        // consume all three, then re-offer the middle one
        for _ in 0..3 {
            set.extract_front();
        }
        set.retry_path(&dests[1]);
        set.assert_skip_invariant();
        assert_eq!(set.extract_front().as_ref(), Some(&dests[1]));
        assert_eq!(set.extract_front(), None);
    }

    #[test]
    #[should_panic(expected = "not awaiting retry")]
    fn retry_of_unknown_destination_panics() {
        let mut set = PathSet::new();
        set.add_path(origin4(1));
        set.retry_path(&origin4(2));
    }

    #[test]
    #[should_panic(expected = "not awaiting retry")]
    fn retry_of_available_destination_panics() {
        let mut set = PathSet::new();
        let a = origin4(1);
        set.add_path(a.clone());
        set.retry_path(&a);
    }

    #[test]
    fn done_requires_finalization() {
        let mut set = PathSet::new();
        let current = set_with_one_extracted(&mut set);
        // everything extracted, but the resolver may still add candidates
        assert!(!set.done_with_primes(&current));
        assert!(!set.done_with_spares(&current));
        assert!(!set.done_with_peer(&current));
        set.finalize();
        assert!(set.done_with_primes(&current));
        assert!(set.done_with_spares(&current));
        assert!(set.done_with_peer(&current));
    }

    fn set_with_one_extracted(set: &mut PathSet) -> Destination {
        set.add_path(peer4(1, 1));
        set.extract_front().unwrap()
    }

    #[test]
    fn done_distinguishes_retryable_from_exhausted() {
        let mut set = PathSet::new();
        set.add_path(peer4(1, 1));
        set.add_path(peer4(1, 2));
        set.finalize();

        let current = set.extract_front().unwrap();
        assert_eq!(set.prime_state(&current), CandidateState::Untried);
        assert!(!set.done_with_primes(&current));

        set.extract_prime(&current).unwrap();
        // both extracted: done, but the tri-state still says a retry could
        // revive them
        assert_eq!(set.prime_state(&current), CandidateState::AwaitingRetry);
        assert!(set.done_with_primes(&current));
        // no v6 address was ever resolved for this peer
        assert_eq!(set.spare_state(&current), CandidateState::Exhausted);
        assert!(set.done_with_spares(&current));
    }

    #[test]
    fn scenario_dual_family_origin() {
        // add (PeerX, v4), (PeerX, v6); front returns the v4, spare the v6
        let mut set = PathSet::new();
        set.add_path(peer4(1, 1));
        set.add_path(peer6(1, 1));
        let current = set.extract_front().unwrap();
        assert_eq!(current, peer4(1, 1));
        assert!(set.have_spare(&current));
        assert_eq!(set.extract_spare(&current), Some(peer6(1, 1)));
    }

    #[test]
    fn scenario_single_path_peer() {
        let mut set = PathSet::new();
        set.add_path(peer4(9, 2));
        set.finalize();
        let got = set.extract_front().unwrap();
        assert_eq!(got, peer4(9, 2));
        assert!(set.done_with_peer(&got));
        assert_eq!(set.extract_front(), None);
    }

    #[test]
    fn notification_coalescing() {
        let mut set = PathSet::new();
        assert!(!set.notification_pending());
        assert!(set.schedule_notification());
        // further schedules coalesce
        assert!(!set.schedule_notification());
        assert!(set.notification_pending());
        assert!(set.consume_notification());
        assert!(!set.consume_notification());
        assert!(!set.notification_pending());
    }

    #[test]
    fn summary_renders_counts() {
        let mut set = PathSet::new();
        assert_eq!(set.to_string(), "paths 0 (0 available)");
        set.add_path(origin4(1));
        set.add_path(origin4(2));
        set.add_path(origin4(3));
        set.extract_front();
        assert_eq!(set.to_string(), "paths 3 (2 available)");
    }

    /// Operations for the skip-invariant property below.
    #[derive(Debug, Clone)]
    enum Op {
        Add { peer: u64, v6: bool },
        ExtractFront,
        ExtractPrime { peer: u64, v6: bool },
        ExtractSpare { peer: u64, v6: bool },
        Retry(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4u64, any::<bool>()).prop_map(|(peer, v6)| Op::Add { peer, v6 }),
            Just(Op::ExtractFront),
            (0..4u64, any::<bool>()).prop_map(|(peer, v6)| Op::ExtractPrime { peer, v6 }),
            (0..4u64, any::<bool>()).prop_map(|(peer, v6)| Op::ExtractSpare { peer, v6 }),
            (0..64usize).prop_map(Op::Retry),
        ]
    }

    fn anchor(peer: u64, v6: bool) -> Destination {
        if v6 { peer6(peer, 0) } else { peer4(peer, 0) }
    }

    proptest! {
        /// After any operation sequence: nothing below the skip point is
        /// available and the skip point never passes an available entry.
        #[test]
        fn skip_invariant_holds(ops in proptest::collection::vec(op_strategy(), 1..80)) {
            let mut set = PathSet::new();
            let mut extracted: Vec<Destination> = Vec::new();
            let mut serial = 0u8;
            for op in ops {
                match op {
                    Op::Add { peer, v6 } => {
                        serial = serial.wrapping_add(1);
                        let dest = if v6 { peer6(peer, serial) } else { peer4(peer, serial) };
                        set.add_path(dest);
                    }
                    Op::ExtractFront => {
                        if let Some(dest) = set.extract_front() {
                            extracted.push(dest);
                        }
                    }
                    Op::ExtractPrime { peer, v6 } => {
                        if let Some(dest) = set.extract_prime(&anchor(peer, v6)) {
                            extracted.push(dest);
                        }
                    }
                    Op::ExtractSpare { peer, v6 } => {
                        if let Some(dest) = set.extract_spare(&anchor(peer, v6)) {
                            extracted.push(dest);
                        }
                    }
                    Op::Retry(pick) => {
                        if !extracted.is_empty() {
                            let dest = extracted.remove(pick % extracted.len());
                            set.retry_path(&dest);
                        }
                    }
                }
                set.assert_skip_invariant();
            }
        }
    }
}
