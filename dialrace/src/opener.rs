//! The per-transaction connection opener.
//!
//! A [`ConnectionOpener`] owns the transaction's [`PathSet`], consumes
//! destinations from the resolver as they arrive, and races connection
//! attempts over them: one "prime" attempt in the family the current peer
//! was first tried with, plus — after a configurable delay — one "spare"
//! attempt in the other family. The first established connection wins; the
//! losing attempt's destination is re-offered for any later re-forwarding
//! pass.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::destination::Destination;
use crate::path_set::PathSet;
use crate::util::{WarnLimiter, next_instance_id};

/// Dials one destination. The seam between racing logic and real sockets.
pub trait Connector: Clone + Send + 'static {
    /// The established connection type.
    type Conn: Send + 'static;

    /// Attempts to open a connection to `dest`.
    fn connect(&self, dest: &Destination) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// Plain TCP dialing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = tokio::net::TcpStream;

    async fn connect(&self, dest: &Destination) -> io::Result<tokio::net::TcpStream> {
        tokio::net::TcpStream::connect(dest.addr()).await
    }
}

/// What the resolver feeds into the opener.
#[derive(Debug)]
pub enum ResolverUpdate {
    /// Freshly resolved candidate destinations, in preference order.
    Destinations(Vec<Destination>),
    /// No further destinations will arrive for this transaction.
    Finalized,
}

/// The resolver-side handle for one transaction's destinations.
///
/// Cheap to clone. Sends are fire-and-forget: if the opener is already gone
/// the transaction is over and the update has nowhere to matter.
#[derive(Debug, Clone)]
pub struct PathFeed {
    tx: mpsc::UnboundedSender<ResolverUpdate>,
}

impl PathFeed {
    /// Offers one destination.
    pub fn add(&self, dest: Destination) {
        self.add_all([dest]);
    }

    /// Offers a batch of destinations from one resolver answer.
    pub fn add_all(&self, dests: impl IntoIterator<Item = Destination>) {
        let batch: Vec<_> = dests.into_iter().collect();
        if batch.is_empty() {
            return;
        }
        self.tx.send(ResolverUpdate::Destinations(batch)).ok();
    }

    /// Signals that resolution is complete for this transaction.
    pub fn finish(&self) {
        self.tx.send(ResolverUpdate::Finalized).ok();
    }
}

/// Tunables for one transaction's connection race. The opener decides these;
/// the path set itself has no configuration surface.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// How long a prime attempt runs alone before a spare of the other
    /// family may race it.
    pub spare_delay: Duration,
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Hard cap on attempts per transaction, if any.
    pub attempt_limit: Option<usize>,
    /// Failed-attempt warnings logged loudly before dropping to debug.
    pub warn_limit: u32,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            spare_delay: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            attempt_limit: None,
            warn_limit: 3,
        }
    }
}

/// Why no connection could be opened.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// Resolution finished without producing a single destination.
    #[error("no destinations resolved")]
    NoDestinations,
    /// Every candidate path was tried and failed.
    #[error("all {tried} candidate paths failed")]
    Exhausted {
        /// Attempts made before giving up.
        tried: usize,
        /// The most recent attempt failure.
        #[source]
        last: Option<io::Error>,
    },
    /// The configured attempt cap was reached.
    #[error("gave up after {0} connection attempts")]
    AttemptLimit(usize),
}

/// A successfully opened connection.
#[derive(Debug)]
pub struct Opened<C> {
    /// The established connection.
    pub conn: C,
    /// The destination it reached.
    pub dest: Destination,
    /// The remaining path state, handed back so a later re-forwarding pass
    /// can pick up where this race left off.
    pub paths: PathSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    Prime,
    Spare,
}

/// Races connection attempts over one transaction's resolved paths.
pub struct ConnectionOpener<C: Connector> {
    id: u64,
    connector: C,
    cfg: RaceConfig,
    paths: PathSet,
    updates: mpsc::UnboundedReceiver<ResolverUpdate>,
    updates_open: bool,
    attempts: JoinSet<(AttemptKind, Destination, io::Result<C::Conn>)>,
    /// In-flight prime attempt's destination.
    prime: Option<Destination>,
    /// In-flight spare attempt's destination.
    spare: Option<Destination>,
    /// First destination tried for the peer we are currently working on;
    /// anchors prime/spare family selection.
    current: Option<Destination>,
    spare_due: Option<Instant>,
    spare_released: bool,
    started: usize,
    last_error: Option<io::Error>,
    warnings: WarnLimiter,
}

impl<C: Connector> ConnectionOpener<C> {
    /// Creates an opener and the feed the resolver pushes destinations into.
    pub fn new(connector: C, cfg: RaceConfig) -> (Self, PathFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let opener = Self {
            id: next_instance_id(),
            connector,
            warnings: WarnLimiter::new(cfg.warn_limit),
            cfg,
            paths: PathSet::new(),
            updates: rx,
            updates_open: true,
            attempts: JoinSet::new(),
            prime: None,
            spare: None,
            current: None,
            spare_due: None,
            spare_released: false,
            started: 0,
            last_error: None,
        };
        (opener, PathFeed { tx })
    }

    /// The current path state, for diagnostics.
    pub fn paths(&self) -> &PathSet {
        &self.paths
    }

    /// Drives the race to completion: the first established connection, or
    /// an error once every destination is known and every attempt failed.
    ///
    /// Dropping the returned future aborts all in-flight attempts.
    pub async fn run(self) -> Result<Opened<C::Conn>, OpenError> {
        let span = debug_span!("opener", id = self.id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<Opened<C::Conn>, OpenError> {
        loop {
            self.launch_attempts();

            if let Some(limit) = self.cfg.attempt_limit {
                if self.started >= limit && self.in_flight() == 0 {
                    return Err(OpenError::AttemptLimit(limit));
                }
            }
            if self.in_flight() == 0 && self.paths.finalized() && self.paths.available() == 0 {
                return Err(self.exhausted());
            }

            let spare_wait = self.spare_due.filter(|_| !self.spare_released);
            tokio::select! {
                update = self.updates.recv(), if self.updates_open => {
                    self.note_update(update);
                }
                Some(finished) = self.attempts.join_next() => {
                    match finished {
                        Ok((kind, dest, result)) => {
                            if let Some(opened) = self.note_attempt_outcome(kind, dest, result) {
                                return Ok(opened);
                            }
                        }
                        Err(err) if err.is_panic() => {
                            std::panic::resume_unwind(err.into_panic())
                        }
                        Err(_) => unreachable!("attempts are not aborted while the opener runs"),
                    }
                }
                _ = maybe_sleep(spare_wait), if spare_wait.is_some() => {
                    trace!("spare delay elapsed");
                    self.spare_released = true;
                }
            }
        }
    }

    /// Applies one resolver update, draining the rest of the burst so a
    /// multi-answer resolution step triggers a single wake-up.
    fn note_update(&mut self, update: Option<ResolverUpdate>) {
        let Some(update) = update else {
            self.updates_open = false;
            // a dropped feed guarantees no further additions
            if !self.paths.finalized() {
                debug!("resolver feed dropped, destinations are final");
                self.paths.finalize();
            }
            return;
        };
        self.ingest(update);
        while let Ok(more) = self.updates.try_recv() {
            self.ingest(more);
        }
        if self.paths.consume_notification() {
            trace!(paths = %self.paths, "candidates changed");
        }
    }

    fn ingest(&mut self, update: ResolverUpdate) {
        match update {
            ResolverUpdate::Destinations(batch) => {
                for dest in batch {
                    self.paths.add_path(dest);
                }
                self.paths.schedule_notification();
            }
            ResolverUpdate::Finalized => {
                if !self.paths.finalized() {
                    self.paths.finalize();
                    debug!(paths = %self.paths, "destinations finalized");
                }
            }
        }
    }

    /// Fills the prime and spare slots with whatever the path set allows
    /// right now, moving on to the next peer when the current one is done.
    fn launch_attempts(&mut self) {
        loop {
            if !self.may_start() {
                return;
            }
            if self.prime.is_none() {
                match self.current.clone() {
                    None => {
                        if let Some(dest) = self.paths.extract_front() {
                            debug!(%dest, "starting attempts for a new peer");
                            self.current = Some(dest.clone());
                            self.spare_due = Some(Instant::now() + self.cfg.spare_delay);
                            self.spare_released = false;
                            self.start_attempt(AttemptKind::Prime, dest);
                        }
                    }
                    Some(current) => {
                        if let Some(dest) = self.paths.extract_prime(&current) {
                            self.start_attempt(AttemptKind::Prime, dest);
                        }
                    }
                }
            }
            if self.spare.is_none() && self.may_start() {
                if let Some(current) = self.current.clone() {
                    // a spare may race once the delay elapsed, or as soon as
                    // no prime can run at all
                    let allowed = self.spare_released || self.prime.is_none();
                    if allowed && self.paths.have_spare(&current) {
                        if let Some(dest) = self.paths.extract_spare(&current) {
                            self.start_attempt(AttemptKind::Spare, dest);
                        }
                    }
                }
            }
            if self.prime.is_none() && self.spare.is_none() {
                if let Some(current) = self.current.clone() {
                    if self.paths.done_with_peer(&current) {
                        debug!(peer = %current.peer(), "done with peer");
                        self.current = None;
                        self.spare_due = None;
                        self.spare_released = false;
                        continue; // the next peer's front candidate, if any
                    }
                }
            }
            return;
        }
    }

    fn may_start(&self) -> bool {
        self.cfg
            .attempt_limit
            .is_none_or(|limit| self.started < limit)
    }

    fn start_attempt(&mut self, kind: AttemptKind, dest: Destination) {
        self.started += 1;
        debug!(%dest, ?kind, attempt = self.started, "starting connection attempt");
        let connector = self.connector.clone();
        let timeout = self.cfg.connect_timeout;
        let task_dest = dest.clone();
        self.attempts.spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&task_dest)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };
            (kind, task_dest, result)
        });
        match kind {
            AttemptKind::Prime => self.prime = Some(dest),
            AttemptKind::Spare => self.spare = Some(dest),
        }
    }

    fn note_attempt_outcome(
        &mut self,
        kind: AttemptKind,
        dest: Destination,
        result: io::Result<C::Conn>,
    ) -> Option<Opened<C::Conn>> {
        self.clear_slot(kind, &dest);
        match result {
            Ok(conn) => {
                debug!(%dest, ?kind, "connection established");
                // the losing attempt is aborted before any definitive
                // failure; its address stays a legitimate candidate
                for loser in [self.prime.take(), self.spare.take()].into_iter().flatten() {
                    debug!(%loser, "re-offering the losing attempt's path");
                    self.paths.retry_path(&loser);
                }
                Some(Opened {
                    conn,
                    dest,
                    paths: std::mem::take(&mut self.paths),
                })
            }
            Err(err) => {
                if self.warnings.allow() {
                    warn!(%dest, ?kind, %err, "connection attempt failed");
                } else {
                    debug!(%dest, ?kind, %err, "connection attempt failed");
                }
                self.last_error = Some(err);
                None
            }
        }
    }

    fn clear_slot(&mut self, kind: AttemptKind, dest: &Destination) {
        let slot = match kind {
            AttemptKind::Prime => &mut self.prime,
            AttemptKind::Spare => &mut self.spare,
        };
        debug_assert_eq!(slot.as_ref(), Some(dest));
        *slot = None;
    }

    fn in_flight(&self) -> usize {
        usize::from(self.prime.is_some()) + usize::from(self.spare.is_some())
    }

    fn exhausted(&mut self) -> OpenError {
        if self.started == 0 {
            OpenError::NoDestinations
        } else {
            OpenError::Exhausted {
                tried: self.started,
                last: self.last_error.take(),
            }
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionOpener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOpener")
            .field("id", &self.id)
            .field("paths", &self.paths)
            .field("current", &self.current)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
